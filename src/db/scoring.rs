//! Face-score bookkeeping: per-thumbnail aggregates, best-thumbnail
//! selection, overflow culling and improver candidate selection.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

use super::{maintenance, Catalogue};
use crate::faces::FaceObservation;

/// A thumbnail still waiting for the scorer.
#[derive(Debug, Clone)]
pub struct PendingThumbnail {
    pub thumbname: String,
    pub image: Vec<u8>,
}

/// Which files the improver revisits.
#[derive(Debug, Clone, Copy)]
pub struct ImproverSelection {
    pub min_probes: u32,
    pub max_probes: u32,
    pub target_score: f64,
}

/// Best thumbnail of a file: highest score, ties broken by name.
const BEST_THUMB: &str = r#"
    SELECT t.thumbname, t.score
    FROM Thumbnail t
    JOIN ThumbnailMap m ON m.thumbname = t.thumbname
    WHERE m.filename = ?1
    ORDER BY t.score DESC, t.thumbname ASC
    LIMIT 1
"#;

/// Recompute the scores of one file's thumbnails and point the MediaFile at
/// the best of them.
pub(crate) fn rescore_file(conn: &Connection, filename: &str) -> Result<()> {
    conn.execute(
        r#"
        UPDATE Thumbnail SET score = scorefn(area, confidence, quality)
        WHERE thumbname IN (SELECT thumbname FROM ThumbnailMap WHERE filename = ?1)
        "#,
        [filename],
    )?;

    let best: Option<(String, f64)> = conn
        .query_row(BEST_THUMB, [filename], |row| Ok((row.get(0)?, row.get(1)?)))
        .optional()?;

    let (bestthumb, bestscore) = match best {
        Some((name, score)) => (Some(name), score),
        None => (None, 0.0),
    };
    conn.execute(
        "UPDATE MediaFile SET bestthumb = ?2, bestscore = ?3 WHERE filename = ?1",
        params![filename, bestthumb, bestscore],
    )?;
    Ok(())
}

/// Keep the `keep` best thumbnails of a file and unmap the rest. Unmapped
/// thumbnails that no other file uses are deleted with their observations.
pub(crate) fn cull_overflow(conn: &Connection, filename: &str, keep: usize) -> Result<usize> {
    let keep = keep.max(1) as i64;
    let surplus: Vec<String> = {
        let mut stmt = conn.prepare(
            r#"
            SELECT t.thumbname
            FROM Thumbnail t
            JOIN ThumbnailMap m ON m.thumbname = t.thumbname
            WHERE m.filename = ?1
            ORDER BY t.score DESC, t.thumbname ASC
            LIMIT -1 OFFSET ?2
            "#,
        )?;
        let names = stmt
            .query_map(params![filename, keep], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        names
    };

    for thumbname in &surplus {
        conn.execute(
            "DELETE FROM ThumbnailMap WHERE filename = ?1 AND thumbname = ?2",
            params![filename, thumbname],
        )?;
        maintenance::drop_if_orphaned(conn, thumbname)?;
    }
    Ok(surplus.len())
}

impl Catalogue {
    pub fn rescore(&mut self, path: &Path) -> Result<()> {
        let filename = path.to_string_lossy().to_string();
        let tx = self.conn.transaction()?;
        rescore_file(&tx, &filename)?;
        tx.commit()?;
        Ok(())
    }

    /// Recompute every thumbnail score and every file's best thumbnail.
    pub fn rescore_all(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE Thumbnail SET score = scorefn(area, confidence, quality)",
            [],
        )?;
        tx.execute(
            r#"
            UPDATE MediaFile SET
                bestthumb = (
                    SELECT t.thumbname FROM Thumbnail t
                    JOIN ThumbnailMap m ON m.thumbname = t.thumbname
                    WHERE m.filename = MediaFile.filename
                    ORDER BY t.score DESC, t.thumbname ASC LIMIT 1),
                bestscore = COALESCE((
                    SELECT t.score FROM Thumbnail t
                    JOIN ThumbnailMap m ON m.thumbname = t.thumbname
                    WHERE m.filename = MediaFile.filename
                    ORDER BY t.score DESC, t.thumbname ASC LIMIT 1), 0)
            "#,
            [],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Trim a file down to its `keep` best thumbnails. Returns how many
    /// mappings were removed.
    pub fn cull_overflow(&mut self, path: &Path, keep: usize) -> Result<usize> {
        let filename = path.to_string_lossy().to_string();
        let tx = self.conn.transaction()?;
        let removed = cull_overflow(&tx, &filename, keep)?;
        tx.commit()?;
        Ok(removed)
    }

    /// Media files whose thumbnails have not all been through the scorer.
    pub fn unchecked_media_files(&self) -> Result<Vec<PathBuf>> {
        let mut stmt = self
            .conn
            .prepare("SELECT filename FROM MediaFile WHERE facechecked = 0 ORDER BY filename")?;
        let results = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .map(PathBuf::from)
            .collect();
        Ok(results)
    }

    pub fn pending_thumbnails(&self, path: &Path) -> Result<Vec<PendingThumbnail>> {
        let filename = path.to_string_lossy().to_string();
        let mut stmt = self.conn.prepare(
            r#"
            SELECT t.thumbname, t.image
            FROM Thumbnail t
            JOIN ThumbnailMap m ON m.thumbname = t.thumbname
            WHERE m.filename = ?1 AND t.facechecked = 0
            ORDER BY t.thumbname
            "#,
        )?;
        let results = stmt
            .query_map([filename.as_str()], |row| {
                Ok(PendingThumbnail {
                    thumbname: row.get(0)?,
                    image: row.get(1)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(results)
    }

    /// Replace a thumbnail's face observations and store the aggregates:
    /// summed area, mean confidence and mean quality. No faces still marks
    /// the thumbnail as checked.
    pub fn record_evaluation(&mut self, thumbname: &str, faces: &[FaceObservation]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM FaceObservation WHERE thumbname = ?1", [thumbname])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO FaceObservation (thumbname, area, confidence, quality) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for face in faces {
                stmt.execute(params![thumbname, face.area, face.confidence, face.quality])?;
            }
        }

        let aggregate = FaceObservation::aggregate(faces);
        tx.execute(
            r#"
            UPDATE Thumbnail
            SET facechecked = 1, area = ?2, confidence = ?3, quality = ?4,
                score = scorefn(?2, ?3, ?4)
            WHERE thumbname = ?1
            "#,
            params![
                thumbname,
                aggregate.area,
                aggregate.confidence,
                aggregate.quality
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Mark a file as face-checked, then rescore and cull it in one
    /// transaction.
    pub fn finish_evaluation(&mut self, path: &Path, keep: usize) -> Result<()> {
        let filename = path.to_string_lossy().to_string();
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE MediaFile SET facechecked = 1 WHERE filename = ?1",
            [filename.as_str()],
        )?;
        rescore_file(&tx, &filename)?;
        cull_overflow(&tx, &filename, keep)?;
        tx.commit()?;
        Ok(())
    }

    /// Files worth another probe, least probed first.
    pub fn improver_candidates(&self, selection: &ImproverSelection) -> Result<Vec<(PathBuf, u32)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT filename, probes
            FROM MediaFile
            WHERE facechecked = 1
              AND canseek = 1
              AND probes < ?2
              AND (probes < ?1 OR bestscore > 0)
              AND bestscore < ?3
            ORDER BY probes ASC, filename ASC
            "#,
        )?;
        let results = stmt
            .query_map(
                params![
                    selection.min_probes,
                    selection.max_probes,
                    selection.target_score
                ],
                |row| Ok((PathBuf::from(row.get::<_, String>(0)?), row.get(1)?)),
            )?
            .filter_map(|r| r.ok())
            .collect();
        Ok(results)
    }
}
