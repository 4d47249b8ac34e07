use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// A box without landmarks, mostly useful for tests and simple detectors.
    pub fn new(x: f32, y: f32, width: f32, height: f32, confidence: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence,
            landmarks: None,
        }
    }

    /// Clip the box to an image of the given size, returning integer pixel
    /// bounds `(x, y, width, height)`, or `None` if nothing is left.
    pub fn clip_to(&self, img_width: u32, img_height: u32) -> Option<(u32, u32, u32, u32)> {
        let x1 = self.x.max(0.0).floor() as u32;
        let y1 = self.y.max(0.0).floor() as u32;
        let x2 = (self.x + self.width).min(img_width as f32).ceil() as u32;
        let y2 = (self.y + self.height).min(img_height as f32).ceil() as u32;
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1, y1, x2 - x1, y2 - y1))
    }
}

/// Face embedding vector produced by a [`Detector`](crate::Detector).
///
/// Embeddings are compared by distance only. There is intentionally no
/// `PartialEq`: two embeddings of the same face are never bit-identical,
/// and an embedding must not be used as a key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// True when every component is a finite number.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Distance under `metric`. Always non-negative; smaller = more similar.
    pub fn distance(&self, other: &Embedding, metric: DistanceMetric) -> f32 {
        match metric {
            DistanceMetric::Euclidean => self.euclidean_distance(other),
            DistanceMetric::Cosine => (1.0 - self.similarity(other)).max(0.0),
        }
    }

    /// Element-wise arithmetic mean of `samples`.
    ///
    /// Returns `None` for an empty slice or when the samples disagree on
    /// dimensionality.
    pub fn mean(samples: &[Embedding]) -> Option<Embedding> {
        let first = samples.first()?;
        let dim = first.dim();
        if samples.iter().any(|s| s.dim() != dim) {
            return None;
        }

        let mut acc = vec![0.0f64; dim];
        for sample in samples {
            for (sum, v) in acc.iter_mut().zip(&sample.values) {
                *sum += f64::from(*v);
            }
        }
        let n = samples.len() as f64;
        Some(Embedding::new(acc.into_iter().map(|s| (s / n) as f32).collect()))
    }

    /// Serialize as packed little-endian f32 values.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Inverse of [`to_le_bytes`](Self::to_le_bytes). `None` if the length
    /// is not a multiple of four.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Embedding> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Embedding::new(values))
    }
}

/// How distance between two embeddings is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// L2 distance, the metric of dlib-style 128-d embeddings.
    Euclidean,
    /// `1 - cosine_similarity`, the metric of ArcFace-style embeddings.
    Cosine,
}

impl DistanceMetric {
    /// Reference threshold of the embedding model family using this metric.
    pub fn default_threshold(self) -> f32 {
        match self {
            DistanceMetric::Euclidean => 0.6,
            // similarity >= 0.40
            DistanceMetric::Cosine => 0.6,
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceMetric::Euclidean => f.write_str("euclidean"),
            DistanceMetric::Cosine => f.write_str("cosine"),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(DistanceMetric::Euclidean),
            "cosine" => Ok(DistanceMetric::Cosine),
            other => Err(format!("unknown distance metric: {other}")),
        }
    }
}

/// Stable identifier assigned by storage when an identity is enrolled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub i64);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An enrolled person with their canonical embedding and visit state.
#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    pub id: IdentityId,
    pub name: String,
    pub email: String,
    #[serde(skip)]
    pub embedding: Embedding,
    pub visits: u32,
    pub rewards: u64,
    pub last_visit: Option<NaiveDate>,
}

/// Input to [`EmbeddingGallery::add`](crate::EmbeddingGallery::add).
#[derive(Debug, Clone)]
pub struct IdentityDraft {
    pub name: String,
    pub email: String,
    pub embedding: Embedding,
}

/// Listing row: everything except the embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub id: IdentityId,
    pub name: String,
    pub email: String,
    pub visits: u32,
    pub rewards: u64,
    pub last_visit: Option<NaiveDate>,
}

impl From<&Identity> for IdentitySummary {
    fn from(identity: &Identity) -> Self {
        Self {
            id: identity.id,
            name: identity.name.clone(),
            email: identity.email.clone(),
            visits: identity.visits,
            rewards: identity.rewards,
            last_visit: identity.last_visit,
        }
    }
}

/// One row of the gallery snapshot scanned by the matcher.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub id: IdentityId,
    pub name: String,
    pub embedding: Embedding,
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchResult {
    Identified { id: IdentityId, distance: f32 },
    Unknown,
}

impl MatchResult {
    pub fn identity(&self) -> Option<IdentityId> {
        match self {
            MatchResult::Identified { id, .. } => Some(*id),
            MatchResult::Unknown => None,
        }
    }
}
