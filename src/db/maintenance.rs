//! Housekeeping passes run between ingest batches.

use anyhow::Result;
use rusqlite::{params, Connection};
use std::io::ErrorKind;

use super::Catalogue;

/// Characters that separate words in tag values.
pub const PUNCTUATION: &str = " \r\n\t\"`~()[]{}<>&^%$#@?!+-=_,.:;|/\\*";

/// Split on any character of `cutset`, dropping empty pieces.
pub fn split_words(s: &str, cutset: &str) -> Vec<String> {
    s.split(|c: char| cutset.contains(c))
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Delete a thumbnail and its observations once no file maps it.
pub(crate) fn drop_if_orphaned(conn: &Connection, thumbname: &str) -> Result<bool> {
    let mapped: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM ThumbnailMap WHERE thumbname = ?1)",
        [thumbname],
        |row| row.get(0),
    )?;
    if mapped {
        return Ok(false);
    }
    conn.execute("DELETE FROM FaceObservation WHERE thumbname = ?1", [thumbname])?;
    conn.execute("DELETE FROM Thumbnail WHERE thumbname = ?1", [thumbname])?;
    Ok(true)
}

/// Remove everything recorded about a file. The File row itself is only
/// removed when `include_file` is set.
pub(crate) fn purge_file(conn: &Connection, filename: &str, include_file: bool) -> Result<()> {
    let thumbnames: Vec<String> = {
        let mut stmt = conn.prepare("SELECT thumbname FROM ThumbnailMap WHERE filename = ?1")?;
        let names = stmt
            .query_map([filename], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        names
    };

    conn.execute("DELETE FROM ThumbnailMap WHERE filename = ?1", [filename])?;
    for thumbname in &thumbnames {
        drop_if_orphaned(conn, thumbname)?;
    }
    conn.execute("DELETE FROM Tag WHERE filename = ?1", [filename])?;
    conn.execute("DELETE FROM WordAssociation WHERE filename = ?1", [filename])?;
    conn.execute("DELETE FROM MediaFile WHERE filename = ?1", [filename])?;
    if include_file {
        conn.execute("DELETE FROM File WHERE filename = ?1", [filename])?;
    }
    Ok(())
}

/// Whether a catalogued path is gone. Opening for read catches every
/// flavour of not-found the platform reports; other errors (permissions,
/// say) keep the row.
fn is_missing(filename: &str) -> bool {
    match std::fs::File::open(filename) {
        Ok(_) => false,
        Err(e) if e.kind() == ErrorKind::NotFound => true,
        Err(e) if e.raw_os_error() == Some(20) => true, // ENOTDIR: a parent became a file
        Err(e) => {
            tracing::warn!(path = %filename, error = %e, "Cannot check file, keeping it");
            false
        }
    }
}

impl Catalogue {
    /// Drop every row belonging to files no longer on disk. Returns how many
    /// files were removed.
    pub fn cull_missing(&mut self) -> Result<usize> {
        let filenames: Vec<String> = {
            let mut stmt = self.conn.prepare("SELECT filename FROM File")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            names
        };

        let missing: Vec<&String> = filenames.iter().filter(|f| is_missing(f)).collect();
        if missing.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        for filename in &missing {
            tracing::info!(path = %filename, "Removing missing file");
            purge_file(&tx, filename, true)?;
        }
        tx.commit()?;

        Ok(missing.len())
    }

    /// Split tag values into lowercase words for every file that has none
    /// yet. Returns how many words were inserted.
    pub fn derive_word_associations(&mut self) -> Result<usize> {
        let rows: Vec<(String, String)> = {
            let mut stmt = self.conn.prepare(
                r#"
                SELECT filename, val FROM Tag
                WHERE val IS NOT NULL
                  AND filename NOT IN (SELECT DISTINCT filename FROM WordAssociation)
                "#,
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };

        if rows.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt =
                tx.prepare("INSERT INTO WordAssociation (filename, word) VALUES (?1, ?2)")?;
            for (filename, val) in &rows {
                for word in split_words(val, PUNCTUATION) {
                    inserted += stmt.execute(params![filename, word.to_lowercase()])?;
                }
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Lowercase tag names written by older versions. A lowercase twin of
    /// the same file wins over the mixed-case row.
    pub fn normalise_tag_keys(&mut self) -> Result<usize> {
        let names: Vec<String> = {
            let mut stmt = self.conn.prepare("SELECT DISTINCT name FROM Tag")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            names
        };

        let renames: Vec<(String, String)> = names
            .into_iter()
            .filter_map(|name| {
                let lower = name.to_lowercase();
                (lower != name).then_some((name, lower))
            })
            .collect();
        if renames.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        let mut changed = 0;
        for (name, lower) in &renames {
            tx.execute(
                r#"
                DELETE FROM Tag WHERE name = ?1
                  AND filename IN (SELECT filename FROM Tag WHERE name = ?2)
                "#,
                params![name, lower],
            )?;
            changed += tx.execute("UPDATE Tag SET name = ?2 WHERE name = ?1", params![name, lower])?;
        }
        tx.commit()?;
        Ok(changed)
    }
}
