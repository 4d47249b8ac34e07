//! Turns a burst of sample images into one canonical gallery embedding.

use crate::detector::{DetectorError, SharedDetector};
use crate::gallery::{EmbeddingGallery, GalleryError};
use crate::types::{Embedding, IdentityDraft, IdentityId};
use image::RgbImage;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Number of samples a capture front-end should aim for.
pub const TARGET_ENROLL_SAMPLES: usize = 10;
/// Largest batch `enroll` accepts.
pub const MAX_ENROLL_SAMPLES: usize = 32;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("no face detected in any sample image, please try again")]
    NoFaceDetected,
    #[error("too many sample images: {got} (at most {max})")]
    TooManySamples { got: usize, max: usize },
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("gallery error: {0}")]
    Gallery(#[from] GalleryError),
}

impl EnrollError {
    /// Whether the caller should simply capture again.
    pub fn is_retriable(&self) -> bool {
        matches!(self, EnrollError::NoFaceDetected)
    }
}

pub struct Enroller {
    detector: SharedDetector,
    gallery: Arc<EmbeddingGallery>,
}

impl Enroller {
    pub fn new(detector: SharedDetector, gallery: Arc<EmbeddingGallery>) -> Self {
        Self { detector, gallery }
    }

    /// Enroll a new identity from an ordered batch of sample images.
    ///
    /// Images without a face are skipped; the first face of every other
    /// image contributes one embedding, and the identity is stored with the
    /// element-wise mean of those embeddings.
    pub fn enroll(&self, name: &str, email: &str, images: &[RgbImage]) -> Result<IdentityId, EnrollError> {
        if images.len() > MAX_ENROLL_SAMPLES {
            return Err(EnrollError::TooManySamples {
                got: images.len(),
                max: MAX_ENROLL_SAMPLES,
            });
        }

        let samples = self.sample_embeddings(images)?;
        tracing::info!(name, usable = samples.len(), offered = images.len(), "enroll: samples extracted");

        if samples.is_empty() {
            return Err(EnrollError::NoFaceDetected);
        }
        let canonical = Embedding::mean(&samples).ok_or_else(|| {
            DetectorError::InferenceFailed("sample embeddings disagree on dimension".into())
        })?;
        let id = self.gallery.add(IdentityDraft {
            name: name.to_string(),
            email: email.to_string(),
            embedding: canonical,
        })?;
        Ok(id)
    }

    /// Like [`enroll`](Self::enroll), decoding the samples from image files.
    /// Files that cannot be read or decoded are skipped like faceless images.
    pub fn enroll_files<P: AsRef<Path>>(
        &self,
        name: &str,
        email: &str,
        paths: &[P],
    ) -> Result<IdentityId, EnrollError> {
        if paths.len() > MAX_ENROLL_SAMPLES {
            return Err(EnrollError::TooManySamples {
                got: paths.len(),
                max: MAX_ENROLL_SAMPLES,
            });
        }

        let images: Vec<RgbImage> = paths
            .iter()
            .filter_map(|path| {
                let path = path.as_ref();
                match image::open(path) {
                    Ok(img) => Some(img.to_rgb8()),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "enroll: skipping unreadable image");
                        None
                    }
                }
            })
            .collect();

        self.enroll(name, email, &images)
    }

    fn sample_embeddings(&self, images: &[RgbImage]) -> Result<Vec<Embedding>, EnrollError> {
        let mut detector = self.detector.lock().map_err(|_| DetectorError::Poisoned)?;
        let mut samples = Vec::with_capacity(images.len());

        for (i, image) in images.iter().enumerate() {
            let faces = detector.detect(image)?;
            let Some(face) = faces.first() else {
                tracing::debug!(sample = i, "enroll: no face in sample");
                continue;
            };
            samples.push(detector.embed(image, face)?);
        }

        Ok(samples)
    }
}
