//! Face alignment to the canonical ArcFace 112×112 crop.
//!
//! A 4-DOF similarity transform (scale, rotation, translation) is fitted
//! from the detected five-point landmarks to the InsightFace reference
//! positions, then the frame is warped with `imageproc`.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};

pub const ALIGNED_SIZE: u32 = 112;

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Closed-form least-squares similarity transform from `src` to `dst`.
///
/// Treating points as complex numbers, the rotation-scale factor is
/// `Σ conj(s)·d / Σ |s|²` over centered points. Returns the row-major
/// 2×3 matrix `[a, -b, tx, b, a, ty]`, or `None` if `src` is degenerate.
fn similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<[f32; 6]> {
    let centroid = |pts: &[(f32, f32); 5]| {
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
        (sx / 5.0, sy / 5.0)
    };
    let (scx, scy) = centroid(src);
    let (dcx, dcy) = centroid(dst);

    let mut spread = 0.0f32;
    let mut re = 0.0f32;
    let mut im = 0.0f32;
    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
        let (sx, sy) = (sx - scx, sy - scy);
        let (dx, dy) = (dx - dcx, dy - dcy);
        spread += sx * sx + sy * sy;
        re += sx * dx + sy * dy;
        im += sx * dy - sy * dx;
    }
    if spread <= f32::EPSILON {
        return None;
    }

    let a = re / spread;
    let b = im / spread;
    let tx = dcx - (a * scx - b * scy);
    let ty = dcy - (b * scx + a * scy);
    Some([a, -b, tx, b, a, ty])
}

/// Warp `image` so the landmarks land on the reference positions.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> Option<RgbImage> {
    let m = similarity_transform(landmarks, &REFERENCE_LANDMARKS_112)?;
    let projection = Projection::from_matrix([m[0], m[1], m[2], m[3], m[4], m[5], 0.0, 0.0, 1.0])?;

    let mut aligned = RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE);
    warp_into(image, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut aligned);
    Some(aligned)
}

/// Fallback for detectors without landmarks: square crop around the box,
/// resized to the aligned size.
pub fn crop_face(image: &RgbImage, face: &BoundingBox) -> Option<RgbImage> {
    let side = face.width.max(face.height);
    let square = BoundingBox::new(
        face.x + (face.width - side) / 2.0,
        face.y + (face.height - side) / 2.0,
        side,
        side,
        face.confidence,
    );
    let (x, y, w, h) = square.clip_to(image.width(), image.height())?;
    let crop = imageops::crop_imm(image, x, y, w, h).to_image();
    Some(imageops::resize(&crop, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle))
}
