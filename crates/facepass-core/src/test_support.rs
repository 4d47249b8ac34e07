//! Deterministic doubles for detector, frame source and clock.

use crate::clock::Clock;
use crate::detector::{Detector, DetectorError};
use crate::pipeline::{FrameSource, SourceError};
use crate::types::{BoundingBox, Embedding};
use chrono::NaiveDate;
use image::{Rgb, RgbImage};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Side of one synthetic face tile.
pub const TILE: u32 = 16;

/// Treats every non-black `TILE`-wide column strip as one face whose
/// embedding is derived from the strip's color.
pub struct ScriptedDetector;

impl ScriptedDetector {
    pub const DIM: usize = 4;

    pub fn embedding_for(r: u8, g: u8, b: u8) -> Embedding {
        Embedding::new(vec![
            r as f32 / 255.0,
            g as f32 / 255.0,
            b as f32 / 255.0,
            0.5,
        ])
    }
}

impl Detector for ScriptedDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let tiles = image.width() / TILE;
        Ok((0..tiles)
            .filter(|i| image.get_pixel(i * TILE + TILE / 2, TILE / 2).0 != [0, 0, 0])
            .map(|i| BoundingBox::new((i * TILE) as f32, 0.0, TILE as f32, TILE as f32, 0.99))
            .collect())
    }

    fn embed(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, DetectorError> {
        let Rgb([r, g, b]) = *image.get_pixel(face.x as u32 + TILE / 2, TILE / 2);
        Ok(Self::embedding_for(r, g, b))
    }

    fn embedding_dim(&self) -> usize {
        Self::DIM
    }
}

/// Always fails, for fault-path tests.
pub struct BrokenDetector;

impl Detector for BrokenDetector {
    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        Err(DetectorError::InferenceFailed("broken".into()))
    }

    fn embed(&mut self, _image: &RgbImage, _face: &BoundingBox) -> Result<Embedding, DetectorError> {
        Err(DetectorError::InferenceFailed("broken".into()))
    }

    fn embedding_dim(&self) -> usize {
        ScriptedDetector::DIM
    }
}

/// Detects like [`ScriptedDetector`] but cannot embed faces of one color.
pub struct UnembeddableDetector(pub (u8, u8, u8));

impl Detector for UnembeddableDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        ScriptedDetector.detect(image)
    }

    fn embed(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, DetectorError> {
        let (r, g, b) = self.0;
        if *image.get_pixel(face.x as u32 + TILE / 2, TILE / 2) == Rgb([r, g, b]) {
            return Err(DetectorError::InferenceFailed("face region lies outside the frame".into()));
        }
        ScriptedDetector.embed(image, face)
    }

    fn embedding_dim(&self) -> usize {
        ScriptedDetector::DIM
    }
}

pub fn face_image(r: u8, g: u8, b: u8) -> RgbImage {
    RgbImage::from_pixel(TILE, TILE, Rgb([r, g, b]))
}

/// One face tile per color, left to right.
pub fn faces_image(colors: &[(u8, u8, u8)]) -> RgbImage {
    let mut image = RgbImage::new(TILE * colors.len().max(1) as u32, TILE);
    for (i, &(r, g, b)) in colors.iter().enumerate() {
        for y in 0..TILE {
            for x in 0..TILE {
                image.put_pixel(i as u32 * TILE + x, y, Rgb([r, g, b]));
            }
        }
    }
    image
}

pub fn blank_image() -> RgbImage {
    RgbImage::new(TILE, TILE)
}

/// Scripted frame source. Items are replayed in order, then the stream
/// ends, or repeats the last frame forever when `endless`.
pub struct VecSource {
    items: VecDeque<Result<RgbImage, SourceError>>,
    endless: Option<RgbImage>,
    dropped: Arc<AtomicBool>,
}

impl VecSource {
    pub fn frames(frames: Vec<RgbImage>) -> Self {
        Self {
            items: frames.into_iter().map(Ok).collect(),
            endless: None,
            dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn then_fail(mut self, error: SourceError) -> Self {
        self.items.push_back(Err(error));
        self
    }

    pub fn endless(frame: RgbImage) -> Self {
        Self {
            items: VecDeque::new(),
            endless: Some(frame),
            dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag set once the source has been released.
    pub fn dropped_flag(&self) -> Arc<AtomicBool> {
        self.dropped.clone()
    }
}

impl FrameSource for VecSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
        match self.items.pop_front() {
            Some(item) => item.map(Some),
            None => Ok(self.endless.clone()),
        }
    }
}

impl Drop for VecSource {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

pub struct FixedClock(Mutex<NaiveDate>);

impl FixedClock {
    pub fn new(date: NaiveDate) -> Self {
        Self(Mutex::new(date))
    }

    pub fn set(&self, date: NaiveDate) {
        *self.0.lock().unwrap() = date;
    }
}

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        *self.0.lock().unwrap()
    }
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}
