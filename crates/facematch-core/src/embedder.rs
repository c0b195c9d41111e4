//! Face embedding extraction via ONNX Runtime.
//!
//! The gallery is enrolled with raw (unnormalized) network outputs and
//! matched by Euclidean distance, so embeddings are passed through as the
//! model produces them.

use crate::types::Embedding;
use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_INPUT_SIZE: u32 = 240;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns a normalized face crop into a fixed-length embedding.
pub trait FaceEmbedder {
    fn extract(&mut self, face: &DynamicImage) -> Result<Embedding, EmbedderError>;
}

/// Settings for an [`OnnxEmbedder`].
#[derive(Debug, Clone)]
pub struct EmbedderSettings {
    /// Side length of the square network input.
    pub input_size: u32,
    /// Expected embedding length; `None` accepts whatever the model emits.
    pub dimension: Option<usize>,
    /// Version tag attached to every embedding.
    pub model_version: Option<String>,
}

impl Default for EmbedderSettings {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_INPUT_SIZE,
            dimension: None,
            model_version: None,
        }
    }
}

/// Embedding network loaded from an ONNX file.
pub struct OnnxEmbedder {
    session: Session,
    settings: EmbedderSettings,
}

impl OnnxEmbedder {
    /// Load the embedding model from the given path.
    pub fn load(model_path: &Path, settings: EmbedderSettings) -> Result<Self, EmbedderError> {
        if !model_path.exists() {
            return Err(EmbedderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            input_size = settings.input_size,
            model_version = ?settings.model_version,
            "loaded embedding model"
        );

        Ok(Self { session, settings })
    }

    /// Resize to the model input and scale RGB to `[0, 1]` in NCHW layout.
    fn preprocess(face: &DynamicImage, size: u32) -> Array4<f32> {
        let rgb = face
            .resize_exact(size, size, FilterType::Triangle)
            .to_rgb8();
        let side = size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));

        for (x, y, pixel) in rgb.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
            }
        }

        tensor
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn extract(&mut self, face: &DynamicImage) -> Result<Embedding, EmbedderError> {
        let input = Self::preprocess(face, self.settings.input_size);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let values = raw.to_vec();
        check_dimension(values.len(), self.settings.dimension)?;

        Ok(Embedding {
            values,
            model_version: self.settings.model_version.clone(),
        })
    }
}

fn check_dimension(actual: usize, expected: Option<usize>) -> Result<(), EmbedderError> {
    match expected {
        Some(expected) if expected != actual => Err(EmbedderError::InferenceFailed(format!(
            "expected {expected}-dim embedding, got {actual}"
        ))),
        _ if actual == 0 => Err(EmbedderError::InferenceFailed(
            "model produced an empty embedding".into(),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_preprocess_output_shape() {
        let face = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 48, Rgb([1, 2, 3])));
        let tensor = OnnxEmbedder::preprocess(&face, 160);
        assert_eq!(tensor.shape(), &[1, 3, 160, 160]);
    }

    #[test]
    fn test_preprocess_scales_to_unit_range() {
        let face = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([255, 0, 51])));
        let tensor = OnnxEmbedder::preprocess(&face, 8);
        assert!((tensor[[0, 0, 3, 3]] - 1.0).abs() < 1e-6);
        assert_eq!(tensor[[0, 1, 3, 3]], 0.0);
        assert!((tensor[[0, 2, 3, 3]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_check_dimension() {
        assert!(check_dimension(512, Some(512)).is_ok());
        assert!(check_dimension(512, None).is_ok());
        assert!(check_dimension(128, Some(512)).is_err());
        assert!(check_dimension(0, None).is_err());
    }

    #[test]
    fn test_load_missing_model() {
        let err = OnnxEmbedder::load(Path::new("/nonexistent/model.onnx"), EmbedderSettings::default())
            .err()
            .unwrap();
        assert!(matches!(err, EmbedderError::ModelNotFound(_)));
    }
}
