use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, in source-image pixel coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    /// Length of the shorter side, used for the minimum face size filter.
    pub fn min_side(&self) -> f32 {
        self.width.min(self.height)
    }
}

/// Face embedding vector as produced by the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Extractor version that produced this embedding (e.g., "resnet-v1").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Wrap raw values without a version tag.
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Attach the extractor version tag.
    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = Some(version.into());
        self
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Callers must ensure equal dimensionality; extra trailing values
    /// on either side are ignored.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One enrolled identity: an embedding and its label.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub embedding: Embedding,
    pub label: String,
}

impl GalleryEntry {
    pub fn new(embedding: Embedding, label: impl Into<String>) -> Self {
        Self {
            embedding,
            label: label.into(),
        }
    }
}

/// Outcome of matching one probe against a gallery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult {
    Identified(String),
    Unidentified,
}

impl MatchResult {
    pub fn label(&self) -> Option<&str> {
        match self {
            MatchResult::Identified(label) => Some(label),
            MatchResult::Unidentified => None,
        }
    }

    pub fn is_identified(&self) -> bool {
        matches!(self, MatchResult::Identified(_))
    }
}

/// The gallery entry selected for a probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Nearest {
    /// Insertion index of the entry in the gallery.
    pub index: usize,
    pub distance: f32,
}
