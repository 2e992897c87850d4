//! Transactional writes for freshly probed files.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

use super::{maintenance, scoring, Catalogue};
use crate::media::{MediaInfo, Thumbnail};

impl Catalogue {
    /// Every known path with its recorded size.
    pub fn known_files(&self) -> Result<HashMap<String, u64>> {
        let mut stmt = self.conn.prepare("SELECT filename, filesize FROM File")?;
        let results = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?.max(0) as u64))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(results)
    }

    /// Record the outcome of a first-time probe. `media` is `None` for files
    /// the decoder rejected, which only get a File row.
    ///
    /// A file whose stored size differs is purged first so the new probe
    /// replaces, rather than merges with, what was recorded before.
    pub fn record_ingest(
        &mut self,
        path: &Path,
        size: u64,
        media: Option<&MediaInfo>,
        keep: usize,
    ) -> Result<()> {
        let filename = path.to_string_lossy().to_string();
        let tx = self.conn.transaction()?;

        let stored: Option<i64> = tx
            .query_row(
                "SELECT filesize FROM File WHERE filename = ?",
                [filename.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if stored.is_some_and(|s| s != size as i64) {
            maintenance::purge_file(&tx, &filename, false)?;
        }

        tx.execute(
            r#"
            INSERT INTO File (filename, filesize) VALUES (?1, ?2)
            ON CONFLICT(filename) DO UPDATE SET filesize = excluded.filesize
            "#,
            params![filename, size as i64],
        )?;

        let Some(media) = media else {
            tx.commit()?;
            return Ok(());
        };

        insert_thumbnails(&tx, &filename, &media.thumbnails)?;

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO Tag (filename, name, val) VALUES (?1, ?2, ?3)
                ON CONFLICT(filename, name) DO UPDATE SET val = excluded.val
                "#,
            )?;
            for (name, val) in &media.tags {
                stmt.execute(params![filename, name.to_lowercase(), val])?;
            }
        }

        tx.execute(
            r#"
            INSERT INTO MediaFile (filename, canseek, probes, facechecked, bestthumb, bestscore)
            VALUES (?1, ?2, ?3, 0,
                    (SELECT thumbname FROM ThumbnailMap WHERE filename = ?1 LIMIT 1), 0)
            ON CONFLICT(filename) DO UPDATE SET
                canseek = excluded.canseek,
                probes = excluded.probes,
                facechecked = 0,
                bestthumb = excluded.bestthumb
            "#,
            params![filename, media.can_seek, media.probes],
        )?;

        scoring::rescore_file(&tx, &filename)?;
        scoring::cull_overflow(&tx, &filename, keep)?;

        tx.commit()?;
        Ok(())
    }

    /// Record an additional probe from the improver. The probe counts even
    /// when it produced nothing. Returns false if the file is no longer
    /// catalogued.
    ///
    /// New thumbnails are left unscored and uncapped here: the evaluator
    /// scores them and culls the file afterwards.
    pub fn record_probe(&mut self, path: &Path, thumbnails: &[Thumbnail], can_seek: bool) -> Result<bool> {
        let filename = path.to_string_lossy().to_string();
        let tx = self.conn.transaction()?;

        let updated = tx.execute(
            r#"
            UPDATE MediaFile
            SET probes = probes + 1,
                facechecked = 0,
                canseek = canseek AND ?2
            WHERE filename = ?1
            "#,
            params![filename, can_seek],
        )?;
        if updated == 0 {
            return Ok(false);
        }

        insert_thumbnails(&tx, &filename, thumbnails)?;

        tx.commit()?;
        Ok(true)
    }
}

/// Insert thumbnails by digest and map them to the file. Existing rows keep
/// their evaluation.
fn insert_thumbnails(conn: &Connection, filename: &str, thumbnails: &[Thumbnail]) -> Result<()> {
    let mut insert_thumb = conn.prepare(
        "INSERT OR IGNORE INTO Thumbnail (thumbname, image) VALUES (?1, ?2)",
    )?;
    let mut insert_map = conn.prepare(
        "INSERT OR IGNORE INTO ThumbnailMap (filename, thumbname) VALUES (?1, ?2)",
    )?;
    for thumb in thumbnails {
        insert_thumb.execute(params![thumb.name, thumb.image])?;
        insert_map.execute(params![filename, thumb.name])?;
    }
    Ok(())
}
