//! Enrolled embedding gallery and its on-disk format.
//!
//! A gallery file holds two index-aligned sequences, one of embeddings and
//! one of labels. Loading validates the whole file up front so a daemon
//! never serves from a partial or ragged gallery.

use crate::types::{Embedding, GalleryEntry};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery unreadable: {0}")]
    Io(#[from] std::io::Error),
    #[error("gallery corrupt: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("gallery has {embeddings} embeddings but {labels} labels")]
    LengthMismatch { embeddings: usize, labels: usize },
    #[error("gallery entry {index} has dimension {actual}, expected {expected}")]
    RaggedDimension {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("gallery entry {index} has a non-finite value")]
    NonFinite { index: usize },
    #[error("gallery entry {index} has an empty embedding")]
    EmptyEmbedding { index: usize },
    #[error("gallery entry {index} has a model version {actual:?}, gallery is {expected:?}")]
    VersionMismatch {
        index: usize,
        expected: Option<String>,
        actual: Option<String>,
    },
}

/// Serialized form: parallel sequences plus optional metadata.
#[derive(Debug, Serialize, Deserialize)]
struct GalleryFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dimension: Option<usize>,
    embeddings: Vec<Vec<f32>>,
    labels: Vec<String>,
}

/// Immutable, validated collection of enrolled faces.
///
/// All entries share one dimension. Order is insertion order and is the
/// tie-break order for matching.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
    dimension: Option<usize>,
    model_version: Option<String>,
}

impl Gallery {
    /// Build a gallery from entries, validating dimension and version consistency.
    ///
    /// Entries without a version tag inherit `model_version`; entries with a
    /// different tag are rejected.
    pub fn from_entries(
        entries: Vec<GalleryEntry>,
        model_version: Option<String>,
    ) -> Result<Self, GalleryError> {
        let mut dimension = None;
        let mut validated = Vec::with_capacity(entries.len());

        for (index, mut entry) in entries.into_iter().enumerate() {
            let actual = entry.embedding.dimension();
            if actual == 0 {
                return Err(GalleryError::EmptyEmbedding { index });
            }
            match dimension {
                None => dimension = Some(actual),
                Some(expected) if expected != actual => {
                    return Err(GalleryError::RaggedDimension {
                        index,
                        expected,
                        actual,
                    });
                }
                Some(_) => {}
            }

            if !entry.embedding.is_finite() {
                return Err(GalleryError::NonFinite { index });
            }

            match (&model_version, &entry.embedding.model_version) {
                (Some(expected), Some(actual)) if expected != actual => {
                    return Err(GalleryError::VersionMismatch {
                        index,
                        expected: model_version.clone(),
                        actual: entry.embedding.model_version.clone(),
                    });
                }
                (None, Some(_)) => {
                    return Err(GalleryError::VersionMismatch {
                        index,
                        expected: None,
                        actual: entry.embedding.model_version.clone(),
                    });
                }
                _ => entry.embedding.model_version = model_version.clone(),
            }

            validated.push(entry);
        }

        Ok(Self {
            entries: validated,
            dimension,
            model_version,
        })
    }

    /// Load a gallery file eagerly.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GalleryError> {
        let path = path.as_ref();
        let raw = std::fs::read(path)?;
        let gallery = Self::from_slice(&raw)?;
        tracing::info!(
            path = %path.display(),
            entries = gallery.len(),
            dimension = ?gallery.dimension(),
            model_version = ?gallery.model_version(),
            "gallery loaded"
        );
        Ok(gallery)
    }

    /// Parse a gallery from its JSON encoding.
    pub fn from_slice(raw: &[u8]) -> Result<Self, GalleryError> {
        let file: GalleryFile = serde_json::from_slice(raw)?;

        if file.embeddings.len() != file.labels.len() {
            return Err(GalleryError::LengthMismatch {
                embeddings: file.embeddings.len(),
                labels: file.labels.len(),
            });
        }

        if let (Some(expected), Some(first)) = (file.dimension, file.embeddings.first()) {
            if first.len() != expected {
                return Err(GalleryError::RaggedDimension {
                    index: 0,
                    expected,
                    actual: first.len(),
                });
            }
        }

        let entries = file
            .embeddings
            .into_iter()
            .zip(file.labels)
            .map(|(values, label)| GalleryEntry::new(Embedding::new(values), label))
            .collect();

        let mut gallery = Self::from_entries(entries, file.model_version)?;
        if gallery.dimension.is_none() {
            gallery.dimension = file.dimension;
        }
        Ok(gallery)
    }

    /// Write the gallery in the same format `load` reads.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), GalleryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_vec()?)?;
        Ok(())
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, GalleryError> {
        let file = GalleryFile {
            model_version: self.model_version.clone(),
            dimension: self.dimension,
            embeddings: self
                .entries
                .iter()
                .map(|e| e.embedding.values.clone())
                .collect(),
            labels: self.entries.iter().map(|e| e.label.clone()).collect(),
        };
        Ok(serde_json::to_vec_pretty(&file)?)
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Shared embedding dimension; `None` for an empty gallery without a declared one.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn model_version(&self) -> Option<&str> {
        self.model_version.as_deref()
    }
}

/// Swappable reference to the active gallery snapshot.
///
/// Readers take an `Arc` and keep using it for the whole match even if
/// the store is replaced meanwhile.
#[derive(Debug, Default)]
pub struct GalleryStore {
    current: RwLock<Arc<Gallery>>,
}

impl GalleryStore {
    pub fn new(gallery: Gallery) -> Self {
        Self {
            current: RwLock::new(Arc::new(gallery)),
        }
    }

    /// The snapshot active right now.
    pub fn snapshot(&self) -> Arc<Gallery> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    /// Install a new snapshot for subsequent matches, returning the previous one.
    pub fn replace(&self, gallery: Gallery) -> Arc<Gallery> {
        let next = Arc::new(gallery);
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, next)
    }

    /// Reload from disk; on failure the current snapshot stays active.
    pub fn reload(&self, path: impl AsRef<Path>) -> Result<Arc<Gallery>, GalleryError> {
        let gallery = Gallery::load(path)?;
        self.replace(gallery);
        Ok(self.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_slice_preserves_order() {
        let raw = br#"{"embeddings": [[1.0, 0.0], [0.0, 1.0]], "labels": ["Alice", "Bob"]}"#;
        let gallery = Gallery::from_slice(raw).unwrap();
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery.dimension(), Some(2));
        assert_eq!(gallery.entries()[0].label, "Alice");
        assert_eq!(gallery.entries()[1].label, "Bob");
        assert_eq!(gallery.model_version(), None);
    }

    #[test]
    fn test_from_slice_empty() {
        let raw = br#"{"embeddings": [], "labels": []}"#;
        let gallery = Gallery::from_slice(raw).unwrap();
        assert!(gallery.is_empty());
        assert_eq!(gallery.dimension(), None);
    }

    #[test]
    fn test_from_slice_empty_keeps_declared_dimension() {
        let raw = br#"{"dimension": 128, "embeddings": [], "labels": []}"#;
        let gallery = Gallery::from_slice(raw).unwrap();
        assert_eq!(gallery.dimension(), Some(128));
    }

    #[test]
    fn test_from_slice_rejects_length_mismatch() {
        let raw = br#"{"embeddings": [[1.0], [2.0]], "labels": ["Alice"]}"#;
        let err = Gallery::from_slice(raw).unwrap_err();
        assert!(matches!(
            err,
            GalleryError::LengthMismatch { embeddings: 2, labels: 1 }
        ));
    }

    #[test]
    fn test_from_slice_rejects_ragged() {
        let raw = br#"{"embeddings": [[1.0, 0.0], [0.0, 1.0, 0.0]], "labels": ["A", "B"]}"#;
        let err = Gallery::from_slice(raw).unwrap_err();
        assert!(matches!(
            err,
            GalleryError::RaggedDimension { index: 1, expected: 2, actual: 3 }
        ));
    }

    #[test]
    fn test_from_slice_rejects_declared_dimension_mismatch() {
        let raw = br#"{"dimension": 3, "embeddings": [[1.0, 0.0]], "labels": ["A"]}"#;
        let err = Gallery::from_slice(raw).unwrap_err();
        assert!(matches!(err, GalleryError::RaggedDimension { index: 0, .. }));
    }

    #[test]
    fn test_from_slice_rejects_corrupt() {
        let err = Gallery::from_slice(b"{not json").unwrap_err();
        assert!(matches!(err, GalleryError::Parse(_)));
    }

    #[test]
    fn test_from_slice_rejects_missing_labels() {
        let err = Gallery::from_slice(br#"{"embeddings": [[1.0]]}"#).unwrap_err();
        assert!(matches!(err, GalleryError::Parse(_)));
    }

    #[test]
    fn test_from_slice_rejects_empty_embedding() {
        let raw = br#"{"embeddings": [[]], "labels": ["A"]}"#;
        let err = Gallery::from_slice(raw).unwrap_err();
        assert!(matches!(err, GalleryError::EmptyEmbedding { index: 0 }));
    }

    #[test]
    fn test_from_entries_rejects_non_finite() {
        let entries = vec![
            GalleryEntry::new(Embedding::new(vec![1.0, 0.0]), "A"),
            GalleryEntry::new(Embedding::new(vec![f32::NAN, 0.0]), "B"),
        ];
        let err = Gallery::from_entries(entries, None).unwrap_err();
        assert!(matches!(err, GalleryError::NonFinite { index: 1 }));
    }

    #[test]
    fn test_from_entries_tags_untagged_entries() {
        let entries = vec![GalleryEntry::new(Embedding::new(vec![1.0]), "A")];
        let gallery = Gallery::from_entries(entries, Some("resnet-v1".into())).unwrap();
        assert_eq!(
            gallery.entries()[0].embedding.model_version.as_deref(),
            Some("resnet-v1")
        );
    }

    #[test]
    fn test_from_entries_rejects_foreign_version() {
        let entries = vec![GalleryEntry::new(
            Embedding::new(vec![1.0]).with_model_version("other"),
            "A",
        )];
        let err = Gallery::from_entries(entries, Some("resnet-v1".into())).unwrap_err();
        assert!(matches!(err, GalleryError::VersionMismatch { index: 0, .. }));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Gallery::load(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, GalleryError::Io(_)));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/gallery.json");
        let entries = vec![
            GalleryEntry::new(Embedding::new(vec![0.5, 0.25]), "Alice"),
            GalleryEntry::new(Embedding::new(vec![-1.0, 2.0]), "Bob"),
        ];
        let gallery = Gallery::from_entries(entries, Some("resnet-v1".into())).unwrap();
        gallery.save(&path).unwrap();

        let loaded = Gallery::load(&path).unwrap();
        assert_eq!(loaded.entries(), gallery.entries());
        assert_eq!(loaded.model_version(), Some("resnet-v1"));
    }

    #[test]
    fn test_store_snapshot_survives_replace() {
        let first = Gallery::from_entries(
            vec![GalleryEntry::new(Embedding::new(vec![1.0]), "old")],
            None,
        )
        .unwrap();
        let second = Gallery::from_entries(
            vec![GalleryEntry::new(Embedding::new(vec![1.0]), "new")],
            None,
        )
        .unwrap();

        let store = GalleryStore::new(first);
        let in_flight = store.snapshot();
        let previous = store.replace(second);

        assert_eq!(in_flight.entries()[0].label, "old");
        assert_eq!(previous.entries()[0].label, "old");
        assert_eq!(store.snapshot().entries()[0].label, "new");
    }

    #[test]
    fn test_store_failed_reload_keeps_snapshot() {
        let gallery = Gallery::from_entries(
            vec![GalleryEntry::new(Embedding::new(vec![1.0]), "kept")],
            None,
        )
        .unwrap();
        let store = GalleryStore::new(gallery);
        let dir = tempfile::tempdir().unwrap();
        assert!(store.reload(dir.path().join("missing.json")).is_err());
        assert_eq!(store.snapshot().entries()[0].label, "kept");
    }
}
