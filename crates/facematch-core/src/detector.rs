//! Face detection: the [`FaceDetector`] seam and an SCRFD implementation.
//!
//! The pipeline wants at most one face per image. [`ScrfdDetector`] runs
//! the SCRFD ONNX model over a letterboxed RGB image, keeps the most
//! confident detection that is large enough, and returns it as a square,
//! contrast-stretched crop ready for the embedder.

use crate::types::BoundingBox;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

pub const DEFAULT_MIN_FACE_SIZE: f32 = 20.0;
pub const DEFAULT_CROP_SIZE: u32 = 240;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A detected face cropped out of its source image.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    /// Box in source-image coordinates.
    pub bbox: BoundingBox,
    /// Square, contrast-stretched RGB crop.
    pub image: RgbImage,
}

impl FaceCrop {
    /// Encode the crop as JPEG for transport.
    pub fn to_jpeg(&self) -> Result<Vec<u8>, DetectorError> {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(self.image.clone()).write_to(&mut buf, ImageFormat::Jpeg)?;
        Ok(buf.into_inner())
    }
}

/// Locates at most one face in an image.
pub trait FaceDetector {
    /// Returns `Ok(None)` when no face passes the detector's thresholds.
    fn detect(&mut self, image: &DynamicImage) -> Result<Option<FaceCrop>, DetectorError>;
}

/// Crop geometry applied to the selected detection.
#[derive(Debug, Clone, Copy)]
pub struct CropSettings {
    /// Detections whose shorter side is below this many pixels are ignored.
    pub min_face_size: f32,
    /// Side length of the square output crop.
    pub crop_size: u32,
}

impl Default for CropSettings {
    fn default() -> Self {
        Self {
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            crop_size: DEFAULT_CROP_SIZE,
        }
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type OutputPair = (usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    settings: CropSettings,
    /// Per-stride output indices for strides [8, 16, 32].
    output_pairs: [OutputPair; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path, settings: CropSettings) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            min_face_size = settings.min_face_size,
            crop_size = settings.crop_size,
            "loaded SCRFD model"
        );

        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires score and bbox outputs for 3 strides, got {} outputs",
                output_names.len()
            )));
        }

        let output_pairs = discover_output_indices(&output_names);
        tracing::debug!(?output_pairs, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            settings,
            output_pairs,
        })
    }

    /// Run the model and return all detections after NMS, most confident first.
    pub fn detect_all(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(image);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (level, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.output_pairs[level];

            let (_, scores) = outputs[score_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("scores stride {stride}: {e}"))
            })?;
            let (_, bboxes) = outputs[bbox_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}"))
            })?;

            candidates.extend(decode_stride(
                scores,
                bboxes,
                stride,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, image: &DynamicImage) -> Result<Option<FaceCrop>, DetectorError> {
        let rgb = image.to_rgb8();
        let detections = self.detect_all(&rgb)?;
        tracing::debug!(count = detections.len(), "SCRFD detections");

        let Some(bbox) = select_face(detections, self.settings.min_face_size) else {
            return Ok(None);
        };

        Ok(crop_face(&rgb, &bbox, self.settings.crop_size).map(|image| FaceCrop { bbox, image }))
    }
}

/// Pick the most confident detection whose shorter side reaches `min_face_size`.
pub fn select_face(detections: Vec<BoundingBox>, min_face_size: f32) -> Option<BoundingBox> {
    detections
        .into_iter()
        .filter(|b| b.min_side() >= min_face_size)
        .fold(None, |best: Option<BoundingBox>, b| match best {
            Some(current) if current.confidence >= b.confidence => Some(current),
            _ => Some(b),
        })
}

/// Cut `bbox` out of `image` (clamped to the image), resize it to a
/// `size`×`size` square and stretch its contrast.
///
/// Returns `None` when the clamped box is empty.
pub fn crop_face(image: &RgbImage, bbox: &BoundingBox, size: u32) -> Option<RgbImage> {
    let (width, height) = image.dimensions();
    let x0 = bbox.x.max(0.0).floor() as u32;
    let y0 = bbox.y.max(0.0).floor() as u32;
    let x1 = ((bbox.x + bbox.width).ceil().max(0.0) as u32).min(width);
    let y1 = ((bbox.y + bbox.height).ceil().max(0.0) as u32).min(height);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    let region = image::imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image();
    let mut face = image::imageops::resize(&region, size, size, FilterType::Triangle);
    stretch_contrast(&mut face);
    Some(face)
}

/// Min-max stretch all channels to the full 0–255 range. A flat image becomes black.
pub fn stretch_contrast(image: &mut RgbImage) {
    let (min, max) = image
        .as_raw()
        .iter()
        .fold((u8::MAX, u8::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));

    let range = max.saturating_sub(min) as f32;
    for v in image.iter_mut() {
        *v = if range > 0.0 {
            (((*v - min) as f32 / range) * 255.0).round() as u8
        } else {
            0
        };
    }
}

/// Letterbox an RGB image into the SCRFD NCHW input tensor.
fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let (width, height) = image.dimensions();
    let scale = (SCRFD_INPUT_SIZE as f32 / width as f32).min(SCRFD_INPUT_SIZE as f32 / height as f32);

    let new_w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
    let pad_x = (SCRFD_INPUT_SIZE as u32 - new_w) as f32 / 2.0;
    let pad_y = (SCRFD_INPUT_SIZE as u32 - new_h) as f32 / 2.0;

    let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);

    // Padding normalizes to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
    let off_x = pad_x.floor() as usize;
    let off_y = pad_y.floor() as usize;
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (x as usize + off_x, y as usize + off_y);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, Letterbox { scale, pad_x, pad_y })
}

/// Discover score/bbox output ordering by name ("score_8", "bbox_16", ...),
/// falling back to the standard positional layout
/// `[scores 8/16/32, bboxes 8/16/32, kps 8/16/32]`.
fn discover_output_indices(names: &[String]) -> [OutputPair; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let mut named = [(0, 0); 3];
    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride)) {
            (Some(score), Some(bbox)) => named[slot] = (score, bbox),
            _ => {
                tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
                return [(0, 3), (1, 4), (2, 5)];
            }
        }
    }
    named
}

/// Decode detections for a single stride level into source-image coordinates.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid_h * grid_w * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    (0..num_anchors)
        .filter_map(|idx| {
            let score = scores.get(idx).copied().unwrap_or(0.0);
            if score <= threshold {
                return None;
            }
            let off = idx * 4;
            let d = bboxes.get(off..off + 4)?;

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let anchor_x = (cell % grid_w) as f32 * s;
            let anchor_y = (cell / grid_w) as f32 * s;

            let x1 = (anchor_x - d[0] * s - letterbox.pad_x) / letterbox.scale;
            let y1 = (anchor_y - d[1] * s - letterbox.pad_y) / letterbox.scale;
            let x2 = (anchor_x + d[2] * s - letterbox.pad_x) / letterbox.scale;
            let y2 = (anchor_y + d[3] * s - letterbox.pad_y) / letterbox.scale;

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
        .collect()
}

/// Non-Maximum Suppression, most confident first.
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

/// Intersection-over-Union between two bounding boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
