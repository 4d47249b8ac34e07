//! Nearest-identity matching of a probe embedding against a gallery snapshot.

use crate::types::{DistanceMetric, Embedding, GalleryEntry, IdentityId, MatchResult};

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
///
/// Implementations must return [`MatchResult::Unknown`] for an empty gallery
/// and must never fail.
pub trait Matcher: Send + Sync {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry]) -> MatchResult;
}

/// Full linear scan over the gallery.
#[derive(Debug, Clone, Copy)]
pub struct LinearMatcher {
    metric: DistanceMetric,
    threshold: f32,
}

impl LinearMatcher {
    pub fn new(metric: DistanceMetric, threshold: f32) -> Self {
        Self { metric, threshold }
    }

    /// Matcher using the metric's reference threshold.
    pub fn with_default_threshold(metric: DistanceMetric) -> Self {
        Self::new(metric, metric.default_threshold())
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Matcher for LinearMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry]) -> MatchResult {
        let mut best: Option<(IdentityId, f32)> = None;

        for entry in gallery {
            if entry.embedding.dim() != probe.dim() {
                tracing::warn!(
                    id = %entry.id,
                    expected = probe.dim(),
                    actual = entry.embedding.dim(),
                    "skipping gallery entry with mismatched dimension"
                );
                continue;
            }

            let distance = probe.distance(&entry.embedding, self.metric);
            if distance.is_nan() || distance > self.threshold {
                continue;
            }

            let closer = match best {
                None => true,
                Some((best_id, best_distance)) => {
                    distance < best_distance || (distance == best_distance && entry.id < best_id)
                }
            };
            if closer {
                best = Some((entry.id, distance));
            }
        }

        match best {
            Some((id, distance)) => MatchResult::Identified { id, distance },
            None => MatchResult::Unknown,
        }
    }
}
