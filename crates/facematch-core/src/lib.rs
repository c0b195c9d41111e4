//! facematch-core — Gallery matching and the models in front of it.
//!
//! The matcher identifies a face embedding against an enrolled gallery by
//! Euclidean nearest neighbour. SCRFD detection and the embedding network
//! run via ONNX Runtime behind the [`FaceDetector`] and [`FaceEmbedder`]
//! traits.

pub mod detector;
pub mod embedder;
pub mod gallery;
pub mod matcher;
pub mod types;

pub use detector::{CropSettings, FaceCrop, FaceDetector, ScrfdDetector};
pub use embedder::{EmbedderSettings, FaceEmbedder, OnnxEmbedder};
pub use gallery::{Gallery, GalleryError, GalleryStore};
pub use matcher::{
    identify, match_embedding, match_with_threshold, EuclideanMatcher, Identification, MatchError,
    Matcher,
};
pub use types::{BoundingBox, Embedding, GalleryEntry, MatchResult, Nearest};
