pub const SCHEMA: &str = r#"
-- Every regular file seen under the media root
CREATE TABLE IF NOT EXISTS File (
    filename TEXT PRIMARY KEY,
    filesize INTEGER NOT NULL
);

-- Files the decoder could demux
CREATE TABLE IF NOT EXISTS MediaFile (
    filename TEXT PRIMARY KEY,
    canseek INTEGER NOT NULL DEFAULT 0,
    probes INTEGER NOT NULL DEFAULT 0,
    facechecked INTEGER NOT NULL DEFAULT 0,
    bestthumb TEXT,
    bestscore REAL NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_mediafile_bestthumb ON MediaFile(bestthumb);
CREATE INDEX IF NOT EXISTS idx_mediafile_facechecked ON MediaFile(facechecked);

-- Demuxer metadata plus reserved keys; names are always lowercase
CREATE TABLE IF NOT EXISTS Tag (
    filename TEXT NOT NULL,
    name TEXT NOT NULL,
    val TEXT,
    PRIMARY KEY (filename, name)
);

CREATE INDEX IF NOT EXISTS idx_tag_filename ON Tag(filename);
CREATE INDEX IF NOT EXISTS idx_tag_name ON Tag(name);

-- Content-addressed thumbnails, keyed by "<sha512 hex>.webp"
CREATE TABLE IF NOT EXISTS Thumbnail (
    thumbname TEXT PRIMARY KEY,
    image BLOB NOT NULL,
    facechecked INTEGER NOT NULL DEFAULT 0,
    area INTEGER NOT NULL DEFAULT 0,
    confidence REAL NOT NULL DEFAULT 0,
    quality REAL NOT NULL DEFAULT 0,
    score REAL NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_thumbnail_facechecked ON Thumbnail(facechecked);

CREATE TABLE IF NOT EXISTS ThumbnailMap (
    filename TEXT NOT NULL,
    thumbname TEXT NOT NULL,
    PRIMARY KEY (filename, thumbname)
);

CREATE INDEX IF NOT EXISTS idx_thumbnailmap_filename ON ThumbnailMap(filename);
CREATE INDEX IF NOT EXISTS idx_thumbnailmap_thumbname ON ThumbnailMap(thumbname);

CREATE TABLE IF NOT EXISTS FaceObservation (
    thumbname TEXT NOT NULL,
    area INTEGER NOT NULL,
    confidence REAL NOT NULL,
    quality REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_faceobservation_thumbname ON FaceObservation(thumbname);

-- Search refinement words split out of tag values
CREATE TABLE IF NOT EXISTS WordAssociation (
    filename TEXT NOT NULL,
    word TEXT NOT NULL,
    PRIMARY KEY (filename, word) ON CONFLICT IGNORE
);

CREATE INDEX IF NOT EXISTS idx_wordassociation_filename ON WordAssociation(filename);
CREATE INDEX IF NOT EXISTS idx_wordassociation_word ON WordAssociation(word);
"#;
