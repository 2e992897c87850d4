use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, GenericImageView};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{FaceObservation, FaceScorer};
use crate::config::ScorerConfig;

const ULTRAFACE_FILE: &str = "ultraface-320.onnx";
const ULTRAFACE_URL: &str =
    "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-320.onnx";

/// Face box in thumbnail pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl FaceBox {
    pub fn area(&self) -> i64 {
        self.width.max(0) as i64 * self.height.max(0) as i64
    }
}

/// UltraFace detector plus an optional face quality model.
///
/// Sessions are loaded once and shared behind mutexes; ONNX Runtime uses
/// `threads` intra-op threads and crop preprocessing runs on a rayon pool
/// of the same size.
pub struct OnnxScorer {
    detector: Mutex<Session>,
    quality: Option<Mutex<Session>>,
    pool: rayon::ThreadPool,
    confidence_threshold: f32,
    nms_threshold: f32,
    min_face_area: i64,
}

impl OnnxScorer {
    pub fn new(config: &ScorerConfig) -> Result<Self> {
        let threads = config.threads.max(1);

        let detector_path = match &config.detector_model {
            Some(path) => path.clone(),
            None => ensure_model(&config.models_dir, ULTRAFACE_FILE, ULTRAFACE_URL)?,
        };
        let detector = load_session(&detector_path, threads)?;
        tracing::info!(model = %detector_path.display(), "Face detector loaded");

        let quality = match &config.quality_model {
            Some(path) => {
                let session = load_session(path, threads)?;
                tracing::info!(model = %path.display(), "Face quality model loaded");
                Some(Mutex::new(session))
            }
            None => {
                tracing::info!("No face quality model configured, quality fixed at 1.0");
                None
            }
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("scorer-{}", i))
            .build()
            .context("Failed to build scorer thread pool")?;

        Ok(Self {
            detector: Mutex::new(detector),
            quality,
            pool,
            confidence_threshold: config.confidence_threshold,
            nms_threshold: config.nms_threshold,
            min_face_area: config.min_face_area,
        })
    }

    fn detect(&self, img: &DynamicImage) -> Result<Vec<(FaceBox, f32)>> {
        let mut session = self
            .detector
            .lock()
            .map_err(|e| anyhow!("Failed to lock detection model: {}", e))?;
        let boxes = run_ultraface_detection(&mut session, img, self.confidence_threshold)?;
        Ok(nms(boxes, self.nms_threshold))
    }

    fn assess_quality(&self, img: &DynamicImage, faces: &[(FaceBox, f32)]) -> Result<Vec<f64>> {
        let Some(quality) = &self.quality else {
            return Ok(vec![1.0; faces.len()]);
        };

        let (width, height) = img.dimensions();
        let inputs: Vec<Vec<f32>> = self.pool.install(|| {
            faces
                .par_iter()
                .map(|(bbox, _)| quality_input(&crop_face(img, bbox, width, height)))
                .collect()
        });

        let mut session = quality
            .lock()
            .map_err(|e| anyhow!("Failed to lock quality model: {}", e))?;
        inputs
            .into_iter()
            .map(|input| run_quality(&mut session, input))
            .collect()
    }
}

impl FaceScorer for OnnxScorer {
    fn observe(&self, image: &[u8]) -> Result<Vec<FaceObservation>> {
        // An unreadable thumbnail has no faces; model failures still propagate.
        let img = match image::load_from_memory(image) {
            Ok(img) => img,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot decode thumbnail, treating it as faceless");
                return Ok(Vec::new());
            }
        };

        let faces: Vec<(FaceBox, f32)> = self
            .detect(&img)?
            .into_iter()
            .filter(|(bbox, _)| bbox.area() > self.min_face_area)
            .collect();
        if faces.is_empty() {
            return Ok(Vec::new());
        }

        let qualities = self.assess_quality(&img, &faces)?;
        Ok(faces
            .iter()
            .zip(qualities)
            .map(|((bbox, confidence), quality)| FaceObservation {
                area: bbox.area(),
                confidence: *confidence as f64,
                quality,
            })
            .collect())
    }
}

/// Download a model file into `models_dir` if it isn't there yet.
fn ensure_model(models_dir: &Path, filename: &str, url: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(models_dir)?;
    let model_path = models_dir.join(filename);

    if !model_path.exists() {
        tracing::info!(model = %filename, "Downloading model...");
        let response = ureq::get(url)
            .call()
            .map_err(|e| anyhow!("Failed to download model: {}", e))?;

        let partial = model_path.with_extension("part");
        let mut file = std::fs::File::create(&partial)?;
        std::io::copy(&mut response.into_reader(), &mut file)?;
        std::fs::rename(&partial, &model_path)?;
        tracing::info!(model = %filename, path = ?model_path, "Model downloaded");
    }

    Ok(model_path)
}

fn load_session(path: &Path, threads: usize) -> Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(threads)?
        .commit_from_file(path)
        .with_context(|| format!("Failed to load model {}", path.display()))?;
    Ok(session)
}

/// Run UltraFace and return boxes above the confidence threshold.
fn run_ultraface_detection(
    session: &mut Session,
    img: &DynamicImage,
    confidence_threshold: f32,
) -> Result<Vec<(FaceBox, f32)>> {
    const INPUT_WIDTH: usize = 320;
    const INPUT_HEIGHT: usize = 240;
    const PLANE: usize = INPUT_WIDTH * INPUT_HEIGHT;

    let (orig_width, orig_height) = img.dimensions();

    let resized = img.resize_exact(
        INPUT_WIDTH as u32,
        INPUT_HEIGHT as u32,
        image::imageops::FilterType::Triangle,
    );
    let rgb = resized.to_rgb8();

    // NCHW, normalised to roughly [-1, 1]
    let mut input_data = vec![0.0f32; 3 * PLANE];
    for (idx, pixel) in rgb.pixels().enumerate() {
        input_data[idx] = (pixel[0] as f32 - 127.0) / 128.0;
        input_data[PLANE + idx] = (pixel[1] as f32 - 127.0) / 128.0;
        input_data[2 * PLANE + idx] = (pixel[2] as f32 - 127.0) / 128.0;
    }

    let input_tensor = Tensor::from_array((
        [1usize, 3, INPUT_HEIGHT, INPUT_WIDTH],
        input_data.into_boxed_slice(),
    ))?;

    let outputs = session.run(ort::inputs!["input" => input_tensor])?;

    let scores_value = outputs
        .get("scores")
        .ok_or_else(|| anyhow!("No scores output"))?;
    let boxes_value = outputs
        .get("boxes")
        .ok_or_else(|| anyhow!("No boxes output"))?;

    let (scores_shape, scores_data) = scores_value.try_extract_tensor::<f32>()?;
    let (_boxes_shape, boxes_data) = boxes_value.try_extract_tensor::<f32>()?;

    // scores: [1, anchors, 2] (background, face); boxes: [1, anchors, 4] normalised corners
    let num_anchors = scores_shape[1] as usize;
    let mut face_boxes = Vec::new();

    for i in 0..num_anchors {
        let confidence = scores_data[i * 2 + 1];
        if confidence <= confidence_threshold {
            continue;
        }

        let x1 = (boxes_data[i * 4] * orig_width as f32) as i32;
        let y1 = (boxes_data[i * 4 + 1] * orig_height as f32) as i32;
        let x2 = (boxes_data[i * 4 + 2] * orig_width as f32) as i32;
        let y2 = (boxes_data[i * 4 + 3] * orig_height as f32) as i32;

        let bbox = FaceBox {
            x: x1.max(0),
            y: y1.max(0),
            width: (x2.min(orig_width as i32) - x1.max(0)).max(1),
            height: (y2.min(orig_height as i32) - y1.max(0)).max(1),
        };
        face_boxes.push((bbox, confidence));
    }

    Ok(face_boxes)
}

/// Non-maximum suppression to remove overlapping detections
fn nms(mut boxes: Vec<(FaceBox, f32)>, threshold: f32) -> Vec<(FaceBox, f32)> {
    boxes.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; boxes.len()];

    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(boxes[i]);

        for j in (i + 1)..boxes.len() {
            if !suppressed[j] && compute_iou(&boxes[i].0, &boxes[j].0) > threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Intersection over union of two boxes
fn compute_iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let intersection = ((x2 - x1).max(0) * (y2 - y1).max(0)) as f32;
    let union = a.area() as f32 + b.area() as f32 - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Crop face region from image with 20% padding
fn crop_face(img: &DynamicImage, bbox: &FaceBox, img_width: u32, img_height: u32) -> DynamicImage {
    let padding_x = (bbox.width as f32 * 0.2) as i32;
    let padding_y = (bbox.height as f32 * 0.2) as i32;

    let x = ((bbox.x - padding_x).max(0) as u32).min(img_width.saturating_sub(1));
    let y = ((bbox.y - padding_y).max(0) as u32).min(img_height.saturating_sub(1));
    let w = ((bbox.width + padding_x * 2) as u32).min(img_width - x);
    let h = ((bbox.height + padding_y * 2) as u32).min(img_height - y);

    img.crop_imm(x, y, w.max(1), h.max(1))
}

/// 112x112 NCHW input with mean 0.5 / std 0.5 normalisation.
fn quality_input(face: &DynamicImage) -> Vec<f32> {
    const SIZE: u32 = 112;
    const PLANE: usize = (SIZE * SIZE) as usize;

    let rgb = face
        .resize_exact(SIZE, SIZE, image::imageops::FilterType::Triangle)
        .to_rgb8();
    let mut data = vec![0.0f32; 3 * PLANE];
    for (idx, pixel) in rgb.pixels().enumerate() {
        for channel in 0..3 {
            data[channel * PLANE + idx] = (pixel[channel] as f32 / 255.0 - 0.5) / 0.5;
        }
    }
    data
}

/// Mean of the quality model's first output, clamped to [0, 1].
fn run_quality(session: &mut Session, input: Vec<f32>) -> Result<f64> {
    let tensor = Tensor::from_array(([1usize, 3, 112, 112], input.into_boxed_slice()))?;
    let outputs = session.run(ort::inputs![tensor])?;

    let output = outputs
        .iter()
        .next()
        .ok_or_else(|| anyhow!("No quality output"))?;
    let (_shape, data) = output.1.try_extract_tensor::<f32>()?;
    if data.is_empty() {
        return Ok(0.0);
    }

    let mean = data.iter().map(|v| *v as f64).sum::<f64>() / data.len() as f64;
    Ok(mean.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: i32, y: i32, width: i32, height: i32) -> FaceBox {
        FaceBox { x, y, width, height }
    }

    #[test]
    fn test_iou() {
        let a = bbox(0, 0, 10, 10);
        assert!((compute_iou(&a, &a) - 1.0).abs() < 0.001);
        assert!((compute_iou(&a, &bbox(20, 20, 10, 10)) - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_nms_keeps_most_confident() {
        let boxes = vec![
            (bbox(0, 0, 100, 100), 0.7),
            (bbox(5, 5, 100, 100), 0.9),
            (bbox(300, 300, 50, 50), 0.8),
        ];
        let kept = nms(boxes, 0.5);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0], (bbox(5, 5, 100, 100), 0.9));
        assert_eq!(kept[1].0, bbox(300, 300, 50, 50));
    }

    #[test]
    fn test_crop_stays_inside_image() {
        let img = DynamicImage::new_rgb8(200, 100);
        let crop = crop_face(&img, &bbox(180, 80, 40, 40), 200, 100);
        assert!(crop.width() >= 1 && crop.width() <= 200);
        assert!(crop.height() >= 1 && crop.height() <= 100);
    }

    #[test]
    fn test_quality_input_normalisation() {
        let white = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(8, 8, image::Rgb([255, 255, 255])));
        let data = quality_input(&white);
        assert_eq!(data.len(), 3 * 112 * 112);
        assert!(data.iter().all(|v| (*v - 1.0).abs() < 1e-6));
    }
}
