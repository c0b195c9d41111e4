//! Nearest-neighbour identification against an enrolled gallery.
//!
//! Distance is Euclidean. The closest entry wins; exact ties go to the
//! entry enrolled first. Without a distance bound the nearest label is
//! always returned, so a stranger is reported as whoever is closest.
//! `EuclideanMatcher::with_max_distance` turns far matches into
//! [`MatchResult::Unidentified`].

use crate::gallery::Gallery;
use crate::types::{Embedding, MatchResult, Nearest};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("gallery entry {index} has dimension {actual}, probe has {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("probe embedding contains a non-finite value")]
    NonFiniteEmbedding,
    #[error("probe produced by model {probe:?}, gallery enrolled with {gallery:?}")]
    ModelVersionMismatch { probe: String, gallery: String },
    #[error("distance bound must be a finite non-negative number, got {0}")]
    InvalidThreshold(f32),
}

/// Strategy for identifying a probe embedding against a gallery.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery) -> Result<MatchResult, MatchError>;
}

/// Euclidean nearest-neighbour matcher with an optional distance bound.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EuclideanMatcher {
    max_distance: Option<f32>,
}

impl EuclideanMatcher {
    /// Always report the nearest label when the gallery is non-empty.
    pub fn nearest() -> Self {
        Self { max_distance: None }
    }

    /// Report `Unidentified` when the nearest entry is farther than `max_distance`.
    pub fn with_max_distance(max_distance: f32) -> Self {
        Self {
            max_distance: Some(max_distance),
        }
    }

    /// Build from an optional bound, rejecting NaN, infinite and negative values.
    pub fn from_max_distance(max_distance: Option<f32>) -> Result<Self, MatchError> {
        match max_distance {
            Some(d) => {
                check_bound(d)?;
                Ok(Self::with_max_distance(d))
            }
            None => Ok(Self::nearest()),
        }
    }

    pub fn max_distance(&self) -> Option<f32> {
        self.max_distance
    }
}

fn check_bound(max_distance: f32) -> Result<(), MatchError> {
    if max_distance.is_finite() && max_distance >= 0.0 {
        Ok(())
    } else {
        Err(MatchError::InvalidThreshold(max_distance))
    }
}

impl EuclideanMatcher {
    /// Match and report the nearest entry alongside the decision.
    pub fn identify(&self, probe: &Embedding, gallery: &Gallery) -> Result<Identification, MatchError> {
        identify(probe, gallery, self.max_distance)
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery) -> Result<MatchResult, MatchError> {
        match_with_threshold(probe, gallery, self.max_distance)
    }
}

/// Find the closest gallery entry to `probe`.
///
/// Returns `Ok(None)` for an empty gallery. Every entry is checked for
/// dimension agreement before a result is returned.
pub fn nearest(probe: &Embedding, gallery: &Gallery) -> Result<Option<Nearest>, MatchError> {
    if !probe.is_finite() {
        return Err(MatchError::NonFiniteEmbedding);
    }

    if let (Some(probe_version), Some(gallery_version)) =
        (probe.model_version.as_deref(), gallery.model_version())
    {
        if probe_version != gallery_version {
            return Err(MatchError::ModelVersionMismatch {
                probe: probe_version.to_string(),
                gallery: gallery_version.to_string(),
            });
        }
    }

    let expected = probe.dimension();
    let mut best: Option<Nearest> = None;

    for (index, entry) in gallery.entries().iter().enumerate() {
        let actual = entry.embedding.dimension();
        if actual != expected {
            return Err(MatchError::DimensionMismatch {
                index,
                expected,
                actual,
            });
        }

        let distance = probe.euclidean_distance(&entry.embedding);
        // Strict comparison keeps the earliest entry on ties.
        let closer = match best {
            None => true,
            Some(current) => distance < current.distance,
        };
        if closer {
            best = Some(Nearest { index, distance });
        }
    }

    Ok(best)
}

/// Identify `probe`, always returning the nearest label for a non-empty gallery.
pub fn match_embedding(probe: &Embedding, gallery: &Gallery) -> Result<MatchResult, MatchError> {
    match_with_threshold(probe, gallery, None)
}

/// Identify `probe`, returning `Unidentified` when the nearest distance exceeds
/// `max_distance`. A distance equal to the bound still identifies.
pub fn match_with_threshold(
    probe: &Embedding,
    gallery: &Gallery,
    max_distance: Option<f32>,
) -> Result<MatchResult, MatchError> {
    identify(probe, gallery, max_distance).map(|id| id.result)
}

/// A match decision together with the entry it was based on.
#[derive(Debug, Clone, PartialEq)]
pub struct Identification {
    pub result: MatchResult,
    /// Closest entry, present whenever the gallery is non-empty.
    pub nearest: Option<Nearest>,
}

/// Like [`match_with_threshold`], also reporting the nearest entry.
pub fn identify(
    probe: &Embedding,
    gallery: &Gallery,
    max_distance: Option<f32>,
) -> Result<Identification, MatchError> {
    if let Some(limit) = max_distance {
        check_bound(limit)?;
    }

    let Some(best) = nearest(probe, gallery)? else {
        return Ok(Identification {
            result: MatchResult::Unidentified,
            nearest: None,
        });
    };

    let result = match max_distance {
        Some(limit) if best.distance > limit => {
            tracing::debug!(
                distance = best.distance,
                max_distance = limit,
                "nearest entry beyond distance bound"
            );
            MatchResult::Unidentified
        }
        _ => {
            let label = gallery.entries()[best.index].label.clone();
            tracing::debug!(index = best.index, distance = best.distance, %label, "gallery match");
            MatchResult::Identified(label)
        }
    };

    Ok(Identification {
        result,
        nearest: Some(best),
    })
}
