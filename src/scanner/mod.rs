pub mod change_detection;
pub mod discovery;

use anyhow::Result;
use std::path::PathBuf;

use crate::db::Catalogue;

pub use change_detection::{detect_changes, ChangeDetectionResult};
pub use discovery::{discover_files, DiscoveredFile};

/// Walks the media root and reports files the catalogue hasn't seen at their
/// current size. Repeated scans of an unchanged tree return the same work.
pub struct Scanner {
    root: PathBuf,
    ignore: Vec<String>,
}

impl Scanner {
    pub fn new(root: PathBuf, ignore: Vec<String>) -> Self {
        Self { root, ignore }
    }

    pub fn scan(&self, db: &Catalogue) -> Result<ScanResult> {
        let discovered = discover_files(&self.root, &self.ignore)?;
        let total_found = discovered.len();
        let known = db.known_files()?;
        let changes = detect_changes(discovered, &known);

        tracing::info!(
            root = %self.root.display(),
            found = total_found,
            new = changes.new_files.len(),
            modified = changes.modified_files.len(),
            "Scan finished"
        );

        Ok(ScanResult {
            total_found,
            new: changes.new_files.len(),
            modified: changes.modified_files.len(),
            work: changes.into_work(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ScanResult {
    pub total_found: usize,
    pub new: usize,
    pub modified: usize,
    pub work: Vec<DiscoveredFile>,
}
