pub mod detector;
pub mod processor;

use anyhow::Result;

pub use detector::OnnxScorer;
pub use processor::Evaluator;

/// Ranking of a thumbnail: larger, more certain, better quality faces win.
pub fn score_fn(area: f64, confidence: f64, quality: f64) -> f64 {
    area.max(0.0).sqrt() * confidence * quality
}

/// One face found in a thumbnail, or the per-thumbnail aggregate of several.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceObservation {
    /// Bounding box area in thumbnail pixels.
    pub area: i64,
    pub confidence: f64,
    pub quality: f64,
}

impl FaceObservation {
    /// Summed area, mean confidence and mean quality. All zero for no faces.
    pub fn aggregate(faces: &[FaceObservation]) -> FaceObservation {
        if faces.is_empty() {
            return FaceObservation {
                area: 0,
                confidence: 0.0,
                quality: 0.0,
            };
        }
        let n = faces.len() as f64;
        FaceObservation {
            area: faces.iter().map(|f| f.area).sum(),
            confidence: faces.iter().map(|f| f.confidence).sum::<f64>() / n,
            quality: faces.iter().map(|f| f.quality).sum::<f64>() / n,
        }
    }
}

/// Finds faces in encoded thumbnail bytes.
pub trait FaceScorer: Send + Sync {
    fn observe(&self, image: &[u8]) -> Result<Vec<FaceObservation>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_fn() {
        assert_eq!(score_fn(0.0, 1.0, 1.0), 0.0);
        assert_eq!(score_fn(-50.0, 1.0, 1.0), 0.0);
        assert!((score_fn(10_000.0, 0.5, 0.5) - 25.0).abs() < 1e-12);
    }

    #[test]
    fn test_aggregate() {
        let faces = [
            FaceObservation { area: 900, confidence: 0.9, quality: 0.4 },
            FaceObservation { area: 1600, confidence: 0.7, quality: 0.8 },
        ];
        let agg = FaceObservation::aggregate(&faces);
        assert_eq!(agg.area, 2500);
        assert!((agg.confidence - 0.8).abs() < 1e-12);
        assert!((agg.quality - 0.6).abs() < 1e-12);
        assert!((score_fn(agg.area as f64, agg.confidence, agg.quality) - 50.0 * 0.8 * 0.6).abs() < 1e-9);

        let none = FaceObservation::aggregate(&[]);
        assert_eq!((none.area, none.confidence, none.quality), (0, 0.0, 0.0));
    }
}
