//! Decides which discovered files need probing.
//!
//! The stored byte size is the only change signal: a path missing from the
//! catalogue is new, a path whose size differs is modified.

use std::collections::HashMap;

use super::discovery::DiscoveredFile;

#[derive(Debug, Clone, Default)]
pub struct ChangeDetectionResult {
    pub new_files: Vec<DiscoveredFile>,
    pub modified_files: Vec<DiscoveredFile>,
}

impl ChangeDetectionResult {
    /// All work items, new then modified, each group sorted by path.
    pub fn into_work(self) -> Vec<DiscoveredFile> {
        let mut work = self.new_files;
        work.extend(self.modified_files);
        work
    }
}

/// Compare what is on disk with the catalogue's `{path -> size}` view.
pub fn detect_changes(discovered: Vec<DiscoveredFile>, known: &HashMap<String, u64>) -> ChangeDetectionResult {
    let mut result = ChangeDetectionResult::default();

    for file in discovered {
        let key = file.path.to_string_lossy().to_string();
        match known.get(&key) {
            None => result.new_files.push(file),
            Some(&size) if size != file.size => result.modified_files.push(file),
            Some(_) => {}
        }
    }

    result.new_files.sort_by(|a, b| a.path.cmp(&b.path));
    result.modified_files.sort_by(|a, b| a.path.cmp(&b.path));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn file(path: &str, size: u64) -> DiscoveredFile {
        DiscoveredFile {
            path: PathBuf::from(path),
            size,
        }
    }

    #[test]
    fn test_detect_changes() {
        let known: HashMap<String, u64> = [
            ("/m/same.mp4".to_string(), 10),
            ("/m/grown.mp4".to_string(), 10),
            ("/m/gone.mp4".to_string(), 10),
        ]
        .into_iter()
        .collect();

        let result = detect_changes(
            vec![
                file("/m/z-new.mp4", 1),
                file("/m/same.mp4", 10),
                file("/m/grown.mp4", 11),
                file("/m/a-new.mp4", 1),
            ],
            &known,
        );

        assert_eq!(result.new_files.len(), 2);
        assert_eq!(result.modified_files.len(), 1);
        let paths: Vec<PathBuf> = result.into_work().into_iter().map(|f| f.path).collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/m/a-new.mp4"),
                PathBuf::from("/m/z-new.mp4"),
                PathBuf::from("/m/grown.mp4")
            ]
        );
    }

    #[test]
    fn test_empty_result() {
        let result = detect_changes(vec![file("/m/a", 3)], &HashMap::from([("/m/a".to_string(), 3)]));
        assert!(result.new_files.is_empty());
        assert!(result.modified_files.is_empty());
        assert!(result.into_work().is_empty());
    }
}
