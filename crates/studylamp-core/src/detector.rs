//! UltraFace face detector via ONNX Runtime.
//!
//! Runs the UltraFace RFB-320 model (320×240 input, two outputs: per-prior
//! class scores and normalized corner boxes), then applies NMS.

use crate::types::{BoundingBox, Detection};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const ULTRAFACE_INPUT_WIDTH: u32 = 320;
const ULTRAFACE_INPUT_HEIGHT: u32 = 240;
const ULTRAFACE_MEAN: f32 = 127.0;
const ULTRAFACE_STD: f32 = 128.0;
const ULTRAFACE_CANDIDATE_THRESHOLD: f32 = 0.3;
const ULTRAFACE_NMS_THRESHOLD: f32 = 0.3;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("invalid frame: expected {expected} RGB bytes, got {actual}")]
    InvalidFrame { expected: usize, actual: usize },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A loaded face-detection model.
///
/// Implementations are blocking; async callers run them on a blocking pool.
pub trait DetectionModel: Send + Sync {
    /// Run one inference over a packed RGB8 frame.
    fn infer(&self, rgb: &[u8], width: u32, height: u32) -> Result<Detection, DetectorError>;

    /// Short human-readable model name for status output.
    fn name(&self) -> &str {
        "face-detector"
    }
}

/// UltraFace-based face detector.
pub struct FaceDetector {
    session: Mutex<Session>,
    scores_idx: usize,
    boxes_idx: usize,
}

impl FaceDetector {
    /// Load the UltraFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded UltraFace model"
        );

        if output_names.len() < 2 {
            return Err(DetectorError::InferenceFailed(format!(
                "UltraFace model requires 2 outputs (scores, boxes), got {}",
                output_names.len()
            )));
        }

        let (scores_idx, boxes_idx) = discover_output_indices(&output_names);

        Ok(Self {
            session: Mutex::new(session),
            scores_idx,
            boxes_idx,
        })
    }

    /// Detect faces in an RGB8 frame, returning boxes sorted by confidence.
    pub fn detect(
        &self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let input = preprocess(rgb, width, height)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectorError::InferenceFailed("session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, scores) = outputs[self.scores_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("scores: {e}")))?;
        let (_, boxes) = outputs[self.boxes_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("boxes: {e}")))?;

        let candidates = decode(scores, boxes, width, height, ULTRAFACE_CANDIDATE_THRESHOLD);
        Ok(nms(candidates, ULTRAFACE_NMS_THRESHOLD))
    }
}

impl DetectionModel for FaceDetector {
    fn infer(&self, rgb: &[u8], width: u32, height: u32) -> Result<Detection, DetectorError> {
        let faces = self.detect(rgb, width, height)?;
        Ok(Detection::from_faces(&faces))
    }

    fn name(&self) -> &str {
        "ultraface-rfb-320"
    }
}

/// Resize to the model input and build a normalized NCHW tensor.
fn preprocess(rgb: &[u8], width: u32, height: u32) -> Result<Array4<f32>, DetectorError> {
    let expected = (width * height * 3) as usize;
    if width == 0 || height == 0 || rgb.len() < expected {
        return Err(DetectorError::InvalidFrame {
            expected,
            actual: rgb.len(),
        });
    }

    let image = RgbImage::from_raw(width, height, rgb[..expected].to_vec()).ok_or(
        DetectorError::InvalidFrame {
            expected,
            actual: rgb.len(),
        },
    )?;
    let resized = if width == ULTRAFACE_INPUT_WIDTH && height == ULTRAFACE_INPUT_HEIGHT {
        image
    } else {
        image::imageops::resize(
            &image,
            ULTRAFACE_INPUT_WIDTH,
            ULTRAFACE_INPUT_HEIGHT,
            FilterType::Triangle,
        )
    };

    let mut tensor = Array4::<f32>::zeros((
        1,
        3,
        ULTRAFACE_INPUT_HEIGHT as usize,
        ULTRAFACE_INPUT_WIDTH as usize,
    ));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] =
                (pixel[c] as f32 - ULTRAFACE_MEAN) / ULTRAFACE_STD;
        }
    }

    Ok(tensor)
}

/// Find the (scores, boxes) output indices by name, falling back to position.
fn discover_output_indices(names: &[String]) -> (usize, usize) {
    let scores = names.iter().position(|n| n == "scores");
    let boxes = names.iter().position(|n| n == "boxes");
    match (scores, boxes) {
        (Some(s), Some(b)) => (s, b),
        _ => {
            tracing::info!(?names, "UltraFace: output names not recognized, using [0]=scores, [1]=boxes");
            (0, 1)
        }
    }
}

/// Decode per-prior scores `[N, 2]` and normalized boxes `[N, 4]` into frame-space faces.
fn decode(
    scores: &[f32],
    boxes: &[f32],
    frame_width: u32,
    frame_height: u32,
    threshold: f32,
) -> Vec<BoundingBox> {
    let w = frame_width as f32;
    let h = frame_height as f32;
    let priors = (scores.len() / 2).min(boxes.len() / 4);

    let mut faces = Vec::new();
    for i in 0..priors {
        // Column 0 is background, column 1 is face.
        let score = scores[i * 2 + 1];
        if score <= threshold {
            continue;
        }
        let x1 = boxes[i * 4].clamp(0.0, 1.0) * w;
        let y1 = boxes[i * 4 + 1].clamp(0.0, 1.0) * h;
        let x2 = boxes[i * 4 + 2].clamp(0.0, 1.0) * w;
        let y2 = boxes[i * 4 + 3].clamp(0.0, 1.0) * h;
        if x2 <= x1 || y2 <= y1 {
            continue;
        }
        faces.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
        });
    }
    faces
}

/// Non-Maximum Suppression. Output is sorted by descending confidence.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<BoundingBox> = Vec::new();
    for candidate in detections {
        if keep.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union_area = a.area() + b.area() - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
