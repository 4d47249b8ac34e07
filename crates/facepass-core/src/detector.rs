//! Face detection contract and the SCRFD reference detector.
//!
//! The core only relies on [`Detector`]. [`OnnxDetector`] pairs the SCRFD
//! detector below with the ArcFace embedder from [`crate::recognizer`],
//! both running via ONNX Runtime on RGB frames.

use crate::recognizer::ArcFaceEmbedder;
use crate::types::{BoundingBox, DistanceMetric, Embedding};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download it from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("detector lock poisoned")]
    Poisoned,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces face regions and embeddings from RGB images.
///
/// Embeddings of the same face must be stable enough to fall within the
/// matcher's threshold of each other.
pub trait Detector: Send {
    /// Detect faces, sorted by descending confidence.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;

    /// Embed one detected face of `image`.
    fn embed(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, DetectorError>;

    /// Dimension of every embedding this detector produces.
    fn embedding_dim(&self) -> usize;

    /// Metric the embedding model's own reference comparison uses. The
    /// daemon matches with it unless configured otherwise.
    fn reference_metric(&self) -> DistanceMetric {
        DistanceMetric::Euclidean
    }
}

/// A detector shared between the enroller and stream sessions.
pub type SharedDetector = Arc<Mutex<dyn Detector>>;

pub fn shared<D: Detector + 'static>(detector: D) -> SharedDetector {
    Arc::new(Mutex::new(detector))
}

/// Mapping between letterboxed model input and original frame coordinates.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: u32) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((target as f32 - new_w) / 2.0).floor(),
            pad_y: ((target as f32 - new_h) / 2.0).floor(),
        }
    }

    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Raw SCRFD head outputs for one stride.
struct StrideOutputs<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    /// Output tensor indices `[score, bbox, kps]` for strides 8, 16 and 32.
    layout: [[usize; 3]; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                names.len()
            )));
        }
        let layout = output_layout(&names);

        tracing::info!(path = model_path, outputs = ?names, ?layout, "loaded SCRFD model");

        Ok(Self { session, layout })
    }

    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let (input, letterbox) = preprocess(image);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut detections = Vec::new();
        for (&stride, [score_idx, bbox_idx, kps_idx]) in SCRFD_STRIDES.iter().zip(self.layout) {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let head = StrideOutputs {
                scores: extract(score_idx, "scores")?,
                bboxes: extract(bbox_idx, "bboxes")?,
                kps: extract(kps_idx, "kps")?,
            };
            detections.extend(decode_stride(&head, stride, &letterbox, SCRFD_CONFIDENCE_THRESHOLD));
        }

        Ok(non_max_suppression(detections, SCRFD_NMS_THRESHOLD))
    }
}

/// Locate `score_N` / `bbox_N` / `kps_N` outputs by name, falling back to
/// the standard export order (scores, then bboxes, then keypoints).
fn output_layout(names: &[String]) -> [[usize; 3]; 3] {
    let find = |kind: &str, stride: usize| {
        let target = format!("{kind}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<[usize; 3]>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some([find("score", stride)?, find("bbox", stride)?, find("kps", stride)?]))
        .collect();

    match named {
        Some(slots) => [slots[0], slots[1], slots[2]],
        None => [[0, 3, 6], [1, 4, 7], [2, 5, 8]],
    }
}

/// Letterbox the frame into the square SCRFD input and normalize to NCHW.
fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::fit(image.width(), image.height(), SCRFD_INPUT_SIZE);
    let new_w = ((image.width() as f32 * letterbox.scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let new_h = ((image.height() as f32 * letterbox.scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let size = SCRFD_INPUT_SIZE as usize;
    // Padding normalizes to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let (off_x, off_y) = (letterbox.pad_x as usize, letterbox.pad_y as usize);

    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (x as usize + off_x, y as usize + off_y);
        if tx >= size || ty >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, letterbox)
}

/// Decode anchor-free detections for one stride level.
fn decode_stride(
    head: &StrideOutputs<'_>,
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid_w = SCRFD_INPUT_SIZE as usize / stride;
    let grid_h = SCRFD_INPUT_SIZE as usize / stride;
    let s = stride as f32;

    (0..grid_w * grid_h * SCRFD_ANCHORS_PER_CELL)
        .filter_map(|idx| {
            let score = *head.scores.get(idx)?;
            if score <= threshold {
                return None;
            }

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid_w) as f32 * s;
            let ay = (cell / grid_w) as f32 * s;

            let d = head.bboxes.get(idx * 4..idx * 4 + 4)?;
            let (x1, y1) = letterbox.unmap(ax - d[0] * s, ay - d[1] * s);
            let (x2, y2) = letterbox.unmap(ax + d[2] * s, ay + d[3] * s);

            let landmarks = head.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|i| letterbox.unmap(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s))
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Keep the most confident box of every overlapping cluster, sorted by
/// descending confidence.
fn non_max_suppression(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(detections.len());
    for candidate in detections {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Intersection-over-Union between two bounding boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 { inter / union } else { 0.0 }
}

/// SCRFD detection plus ArcFace embedding.
pub struct OnnxDetector {
    scrfd: ScrfdDetector,
    arcface: ArcFaceEmbedder,
}

impl OnnxDetector {
    pub fn load(scrfd_path: &str, arcface_path: &str) -> Result<Self, DetectorError> {
        Ok(Self {
            scrfd: ScrfdDetector::load(scrfd_path)?,
            arcface: ArcFaceEmbedder::load(arcface_path)?,
        })
    }
}

impl Detector for OnnxDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        self.scrfd.detect(image)
    }

    fn embed(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, DetectorError> {
        self.arcface.extract(image, face)
    }

    fn embedding_dim(&self) -> usize {
        ArcFaceEmbedder::EMBEDDING_DIM
    }

    fn reference_metric(&self) -> DistanceMetric {
        ArcFaceEmbedder::REFERENCE_METRIC
    }
}
