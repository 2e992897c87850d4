//! The catalogue: the single SQLite store every pipeline stage writes to.

mod schema;
pub mod ingest;
pub mod maintenance;
pub mod scoring;

use anyhow::{Context, Result};
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub use schema::SCHEMA;
pub use scoring::{ImproverSelection, PendingThumbnail};

use crate::faces::score_fn;

/// How long a connection waits on a competing writer before SQLite reports busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A MediaFile row.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFileRecord {
    pub filename: String,
    pub canseek: bool,
    pub probes: u32,
    pub facechecked: bool,
    pub bestthumb: Option<String>,
    pub bestscore: f64,
}

/// A Thumbnail row without its image bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct ThumbnailRecord {
    pub thumbname: String,
    pub facechecked: bool,
    pub area: i64,
    pub confidence: f64,
    pub quality: f64,
    pub score: f64,
}

pub struct Catalogue {
    pub(crate) conn: Connection,
}

impl Catalogue {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open catalogue {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::configure(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.create_scalar_function(
            "scorefn",
            3,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| {
                let area = ctx.get::<Option<f64>>(0)?.unwrap_or(0.0);
                let confidence = ctx.get::<Option<f64>>(1)?.unwrap_or(0.0);
                let quality = ctx.get::<Option<f64>>(2)?.unwrap_or(0.0);
                Ok(score_fn(area, confidence, quality))
            },
        )?;
        Ok(Self { conn })
    }

    /// Create any missing tables and indexes.
    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Fold the write-ahead log back into the main file and truncate it.
    pub fn truncate_wal(&self) -> Result<()> {
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }

    pub fn media_file(&self, path: &Path) -> Result<Option<MediaFileRecord>> {
        let path_str = path.to_string_lossy().to_string();
        let record = self
            .conn
            .query_row(
                r#"
                SELECT filename, canseek, probes, facechecked, bestthumb, bestscore
                FROM MediaFile
                WHERE filename = ?
                "#,
                [path_str.as_str()],
                |row| {
                    Ok(MediaFileRecord {
                        filename: row.get(0)?,
                        canseek: row.get(1)?,
                        probes: row.get(2)?,
                        facechecked: row.get(3)?,
                        bestthumb: row.get(4)?,
                        bestscore: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Thumbnails mapped to a file, best first.
    pub fn thumbnails_for(&self, path: &Path) -> Result<Vec<ThumbnailRecord>> {
        let path_str = path.to_string_lossy().to_string();
        let mut stmt = self.conn.prepare(
            r#"
            SELECT t.thumbname, t.facechecked, t.area, t.confidence, t.quality, t.score
            FROM Thumbnail t
            JOIN ThumbnailMap m ON m.thumbname = t.thumbname
            WHERE m.filename = ?
            ORDER BY t.score DESC, t.thumbname ASC
            "#,
        )?;
        let results = stmt
            .query_map([path_str.as_str()], |row| {
                Ok(ThumbnailRecord {
                    thumbname: row.get(0)?,
                    facechecked: row.get(1)?,
                    area: row.get(2)?,
                    confidence: row.get(3)?,
                    quality: row.get(4)?,
                    score: row.get(5)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(results)
    }

    pub fn thumbnail_image(&self, thumbname: &str) -> Result<Option<Vec<u8>>> {
        let image = self
            .conn
            .query_row(
                "SELECT image FROM Thumbnail WHERE thumbname = ?",
                [thumbname],
                |row| row.get(0),
            )
            .optional()?;
        Ok(image)
    }

    pub fn tags_for(&self, path: &Path) -> Result<BTreeMap<String, String>> {
        let path_str = path.to_string_lossy().to_string();
        let mut stmt = self
            .conn
            .prepare("SELECT name, val FROM Tag WHERE filename = ?")?;
        let results = stmt
            .query_map([path_str.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(results)
    }

    pub fn words_for(&self, path: &Path) -> Result<Vec<String>> {
        let path_str = path.to_string_lossy().to_string();
        let mut stmt = self
            .conn
            .prepare("SELECT word FROM WordAssociation WHERE filename = ? ORDER BY word")?;
        let results = stmt
            .query_map([path_str.as_str()], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(results)
    }

    /// Row count of one catalogue table.
    pub fn count(&self, table: CatalogueTable) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.name());
        Ok(self.conn.query_row(&sql, [], |row| row.get(0))?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogueTable {
    File,
    MediaFile,
    Tag,
    Thumbnail,
    ThumbnailMap,
    FaceObservation,
    WordAssociation,
}

impl CatalogueTable {
    pub const ALL: [CatalogueTable; 7] = [
        CatalogueTable::File,
        CatalogueTable::MediaFile,
        CatalogueTable::Tag,
        CatalogueTable::Thumbnail,
        CatalogueTable::ThumbnailMap,
        CatalogueTable::FaceObservation,
        CatalogueTable::WordAssociation,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CatalogueTable::File => "File",
            CatalogueTable::MediaFile => "MediaFile",
            CatalogueTable::Tag => "Tag",
            CatalogueTable::Thumbnail => "Thumbnail",
            CatalogueTable::ThumbnailMap => "ThumbnailMap",
            CatalogueTable::FaceObservation => "FaceObservation",
            CatalogueTable::WordAssociation => "WordAssociation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let db = Catalogue::open_in_memory().unwrap();
        db.init().unwrap();
        db.init().unwrap();
        for table in CatalogueTable::ALL {
            assert_eq!(db.count(table).unwrap(), 0, "{}", table.name());
        }
    }

    #[test]
    fn test_scorefn_udf() {
        let db = Catalogue::open_in_memory().unwrap();
        let score: f64 = db
            .conn
            .query_row("SELECT scorefn(400, 0.5, 0.5)", [], |row| row.get(0))
            .unwrap();
        assert!((score - 5.0).abs() < 1e-9);

        let negative: f64 = db
            .conn
            .query_row("SELECT scorefn(-10, 1.0, 1.0)", [], |row| row.get(0))
            .unwrap();
        assert_eq!(negative, 0.0);
    }

    #[test]
    fn test_open_file_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let db = Catalogue::open(&dir.path().join("info.db")).unwrap();
        db.init().unwrap();
        let mode: String = db
            .conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        db.truncate_wal().unwrap();
    }
}
