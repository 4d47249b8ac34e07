//! ArcFace face embedder via ONNX Runtime.
//!
//! Extracts 512-dimensional, L2-normalized embeddings from aligned RGB
//! face crops using the w600k_r50 ArcFace model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::detector::DetectorError;
use crate::types::{BoundingBox, DistanceMetric, Embedding};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;

pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    pub const EMBEDDING_DIM: usize = 512;
    /// ArcFace embeddings are compared by cosine similarity.
    pub const REFERENCE_METRIC: DistanceMetric = DistanceMetric::Cosine;

    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Embed one detected face. Landmarked faces are aligned first; faces
    /// without landmarks fall back to a square crop.
    pub fn extract(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, DetectorError> {
        let aligned = face
            .landmarks
            .as_ref()
            .and_then(|lms| alignment::align_face(image, lms))
            .or_else(|| alignment::crop_face(image, face))
            .ok_or_else(|| DetectorError::InferenceFailed("face region lies outside the frame".into()))?;

        let input = preprocess(&aligned);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != Self::EMBEDDING_DIM {
            return Err(DetectorError::InferenceFailed(format!(
                "expected {}-dim embedding, got {}",
                Self::EMBEDDING_DIM,
                raw.len()
            )));
        }

        Ok(Embedding::new(l2_normalize(raw)))
    }
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

/// Convert an aligned 112×112 RGB crop into a normalized NCHW tensor.
fn preprocess(aligned: &RgbImage) -> Array4<f32> {
    let size = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in aligned.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        if x >= size || y >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, y, x]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}
