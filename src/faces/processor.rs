use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::FaceScorer;
use crate::db::Catalogue;

/// Totals from one evaluator pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluationSummary {
    pub files: usize,
    pub thumbnails: usize,
    pub faces: usize,
}

/// Runs the scorer over thumbnails that haven't been checked yet and folds
/// the results back into the catalogue.
pub struct Evaluator {
    scorer: Arc<dyn FaceScorer>,
    keep: usize,
}

impl Evaluator {
    pub fn new(scorer: Arc<dyn FaceScorer>, keep: usize) -> Self {
        Self { scorer, keep }
    }

    /// Evaluate every file with `facechecked = false`, stopping early when
    /// `shutdown` is raised.
    pub fn run(&self, db: &mut Catalogue, shutdown: &AtomicBool) -> Result<EvaluationSummary> {
        let mut summary = EvaluationSummary::default();

        for path in db.unchecked_media_files()? {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            let (thumbnails, faces) = self.evaluate_file(db, &path)?;
            summary.files += 1;
            summary.thumbnails += thumbnails;
            summary.faces += faces;
        }

        if summary.files > 0 {
            tracing::info!(
                files = summary.files,
                thumbnails = summary.thumbnails,
                faces = summary.faces,
                "Evaluation pass finished"
            );
        }
        Ok(summary)
    }

    /// Score one file's pending thumbnails, then mark it checked, rescore and
    /// cull. A scorer error leaves the file unchecked and ends the pass.
    pub fn evaluate_file(&self, db: &mut Catalogue, path: &Path) -> Result<(usize, usize)> {
        let pending = db.pending_thumbnails(path)?;
        let mut faces_found = 0;

        for thumb in &pending {
            let faces = self
                .scorer
                .observe(&thumb.image)
                .with_context(|| format!("Scoring {} of {}", thumb.thumbname, path.display()))?;
            faces_found += faces.len();
            db.record_evaluation(&thumb.thumbname, &faces)?;
        }

        db.finish_evaluation(path, self.keep)?;
        tracing::debug!(path = %path.display(), thumbnails = pending.len(), faces = faces_found, "Evaluated");
        Ok((pending.len(), faces_found))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faces::FaceObservation;
    use crate::media::{MediaInfo, MediaType, Thumbnail};
    use std::collections::BTreeMap;

    /// Treats the first byte of the image as a face area hint.
    struct ByteScorer;

    impl FaceScorer for ByteScorer {
        fn observe(&self, image: &[u8]) -> Result<Vec<FaceObservation>> {
            match image.first() {
                Some(b'!') => anyhow::bail!("model session poisoned"),
                Some(&b) if b > b'a' => Ok(vec![FaceObservation {
                    area: (b as i64) * 100,
                    confidence: 0.9,
                    quality: 0.5,
                }]),
                _ => Ok(Vec::new()),
            }
        }
    }

    #[test]
    fn test_evaluates_unchecked_files() {
        let mut db = Catalogue::open_in_memory().unwrap();
        db.init().unwrap();

        let path = Path::new("/media/a.mp4");
        let info = MediaInfo {
            media_type: MediaType::Video,
            tags: BTreeMap::new(),
            thumbnails: ["a", "z", "0"]
                .iter()
                .map(|s| Thumbnail::from_image(s.as_bytes().to_vec()))
                .collect(),
            can_seek: true,
            probes: 1,
            failures: Vec::new(),
        };
        db.record_ingest(path, 1, Some(&info), 4).unwrap();

        let evaluator = Evaluator::new(Arc::new(ByteScorer), 2);
        let summary = evaluator.run(&mut db, &AtomicBool::new(false)).unwrap();
        assert_eq!(
            summary,
            EvaluationSummary {
                files: 1,
                thumbnails: 3,
                faces: 1
            }
        );

        let record = db.media_file(path).unwrap().unwrap();
        assert!(record.facechecked);
        let z = Thumbnail::from_image(b"z".to_vec()).name;
        assert_eq!(record.bestthumb.as_deref(), Some(z.as_str()));
        assert_eq!(db.thumbnails_for(path).unwrap().len(), 2);

        let again = evaluator.run(&mut db, &AtomicBool::new(false)).unwrap();
        assert_eq!(again, EvaluationSummary::default());
    }

    #[test]
    fn test_shutdown_stops_pass() {
        let mut db = Catalogue::open_in_memory().unwrap();
        db.init().unwrap();
        let info = MediaInfo {
            media_type: MediaType::Video,
            tags: BTreeMap::new(),
            thumbnails: vec![Thumbnail::from_image(b"q".to_vec())],
            can_seek: true,
            probes: 1,
            failures: Vec::new(),
        };
        db.record_ingest(Path::new("/m/x"), 1, Some(&info), 4).unwrap();

        let evaluator = Evaluator::new(Arc::new(ByteScorer), 4);
        let summary = evaluator.run(&mut db, &AtomicBool::new(true)).unwrap();
        assert_eq!(summary.files, 0);
        assert_eq!(db.unchecked_media_files().unwrap().len(), 1);
    }

    #[test]
    fn test_scorer_error_stops_pass_and_leaves_file_unchecked() {
        let mut db = Catalogue::open_in_memory().unwrap();
        db.init().unwrap();
        let path = Path::new("/m/broken.mp4");
        let info = MediaInfo {
            media_type: MediaType::Video,
            tags: BTreeMap::new(),
            thumbnails: vec![Thumbnail::from_image(b"!".to_vec())],
            can_seek: true,
            probes: 1,
            failures: Vec::new(),
        };
        db.record_ingest(path, 1, Some(&info), 4).unwrap();

        let evaluator = Evaluator::new(Arc::new(ByteScorer), 4);
        let err = evaluator.run(&mut db, &AtomicBool::new(false)).unwrap_err();
        assert!(format!("{:#}", err).contains("model session poisoned"));

        let record = db.media_file(path).unwrap().unwrap();
        assert!(!record.facechecked);
        assert_eq!(db.pending_thumbnails(path).unwrap().len(), 1);
        assert_eq!(db.unchecked_media_files().unwrap(), vec![path.to_path_buf()]);
    }
}
