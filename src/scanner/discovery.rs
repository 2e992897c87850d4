use anyhow::Result;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Suffixes of the catalogue's auxiliary files.
pub const AUXILIARY_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

/// A regular file found under the media root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub size: u64,
}

fn is_excluded(entry: &DirEntry, ignore: &[String]) -> bool {
    let name = entry.file_name().to_string_lossy();
    if ignore.iter().any(|i| *i == name) {
        return true;
    }
    entry.file_type().is_file() && AUXILIARY_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Walk `root` recursively, collecting every regular file not excluded by
/// name. Ignored directories are not descended into. Unreadable entries
/// below the root are skipped, but an unreadable root fails the walk.
pub fn discover_files(root: &Path, ignore: &[String]) -> Result<Vec<DiscoveredFile>> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_excluded(e, ignore));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Cannot read media root {}", root.display())));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.metadata() {
            Ok(metadata) => files.push(DiscoveredFile {
                path: entry.into_path(),
                size: metadata.len(),
            }),
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), error = %e, "Cannot stat file");
            }
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}
