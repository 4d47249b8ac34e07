//! Frame annotation and JPEG encoding.

use crate::types::{BoundingBox, IdentityId};
use image::codecs::jpeg::JpegEncoder;
use font8x8::{UnicodeFonts, BASIC_FONTS, LATIN_FONTS};
use image::{ImageError, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use serde::Serialize;

const IDENTIFIED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const OUTLINE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BORDER_WIDTH: u32 = 2;
/// Each 8x8 glyph cell is drawn as a square of this many pixels.
const GLYPH_SCALE: u32 = 2;
const GLYPH_SIZE: u32 = 8 * GLYPH_SCALE;
const LINE_HEIGHT: u32 = GLYPH_SIZE + 2;

/// What the pipeline concluded about one face.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaceLabel {
    /// Recognized; visit state is the value after this frame's update.
    Identified {
        id: IdentityId,
        name: String,
        visits: u32,
        rewards: u64,
        distance: f32,
    },
    Unknown,
    /// Enrollment preview: region only, no recognition.
    Outline,
}

impl FaceLabel {
    /// Caption lines shown next to the face.
    pub fn caption(&self) -> Vec<String> {
        match self {
            FaceLabel::Identified {
                name,
                visits,
                rewards,
                ..
            } => vec![
                name.clone(),
                format!("Visits: {visits}"),
                format!("Rewards: {rewards}"),
            ],
            FaceLabel::Unknown => vec!["Unknown".to_string()],
            FaceLabel::Outline => Vec::new(),
        }
    }

    fn color(&self) -> Rgb<u8> {
        match self {
            FaceLabel::Identified { .. } => IDENTIFIED_COLOR,
            FaceLabel::Unknown => UNKNOWN_COLOR,
            FaceLabel::Outline => OUTLINE_COLOR,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FaceAnnotation {
    pub region: BoundingBox,
    pub label: FaceLabel,
}

/// One processed frame, ready for the consumer.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Position in the session, starting at 0 with no gaps.
    pub sequence: u64,
    pub jpeg: Vec<u8>,
    pub annotations: Vec<FaceAnnotation>,
}

/// Outline every annotated face in place and write its caption above the
/// box, or below it when the box touches the top of the frame.
pub fn draw_annotations(image: &mut RgbImage, annotations: &[FaceAnnotation]) {
    let (img_w, img_h) = image.dimensions();
    for annotation in annotations {
        let Some((x, y, w, h)) = annotation.region.clip_to(img_w, img_h) else {
            continue;
        };
        let color = annotation.label.color();
        for inset in 0..BORDER_WIDTH {
            if w <= inset * 2 || h <= inset * 2 {
                break;
            }
            let rect = Rect::at((x + inset) as i32, (y + inset) as i32)
                .of_size(w - inset * 2, h - inset * 2);
            draw_hollow_rect_mut(image, rect, color);
        }

        let caption = annotation.label.caption();
        let block = caption.len() as u32 * LINE_HEIGHT;
        let top = if y >= block { y - block } else { y + h + BORDER_WIDTH };
        for (line, text) in caption.iter().enumerate() {
            draw_text(image, x as i32, (top + line as u32 * LINE_HEIGHT) as i32, text, color);
        }
    }
}

/// Draw `text` with its top-left corner at `(x, y)`, clipped to the image.
fn draw_text(image: &mut RgbImage, x: i32, y: i32, text: &str, color: Rgb<u8>) {
    for (i, c) in text.chars().enumerate() {
        let glyph = BASIC_FONTS
            .get(c)
            .or_else(|| LATIN_FONTS.get(c))
            .or_else(|| BASIC_FONTS.get('?'))
            .unwrap_or_default();
        let left = x + (i as u32 * GLYPH_SIZE) as i32;
        for (row, bits) in glyph.iter().enumerate() {
            for col in 0..8 {
                if bits & (1 << col) == 0 {
                    continue;
                }
                let cell = Rect::at(left + (col * GLYPH_SCALE) as i32, y + (row as u32 * GLYPH_SCALE) as i32)
                    .of_size(GLYPH_SCALE, GLYPH_SCALE);
                draw_filled_rect_mut(image, cell, color);
            }
        }
    }
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)).encode_image(image)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotation(label: FaceLabel) -> FaceAnnotation {
        FaceAnnotation {
            region: BoundingBox::new(2.0, 2.0, 10.0, 10.0, 0.9),
            label,
        }
    }

    #[test]
    fn test_identified_caption() {
        let label = FaceLabel::Identified {
            id: IdentityId(1),
            name: "Noor".into(),
            visits: 2,
            rewards: 30,
            distance: 0.1,
        };
        assert_eq!(label.caption(), vec!["Noor", "Visits: 2", "Rewards: 30"]);
        assert_eq!(FaceLabel::Unknown.caption(), vec!["Unknown"]);
        assert!(FaceLabel::Outline.caption().is_empty());
    }

    #[test]
    fn test_draw_colors_by_label() {
        let mut image = RgbImage::new(32, 32);
        draw_annotations(&mut image, &[annotation(FaceLabel::Unknown)]);
        assert_eq!(*image.get_pixel(2, 2), UNKNOWN_COLOR);
        assert_eq!(*image.get_pixel(3, 3), UNKNOWN_COLOR);
        assert_eq!(*image.get_pixel(6, 6), Rgb([0, 0, 0]));
    }

    fn has_color(image: &RgbImage, rows: std::ops::Range<u32>, color: Rgb<u8>) -> bool {
        rows.flat_map(|y| (0..image.width()).map(move |x| (x, y)))
            .any(|(x, y)| *image.get_pixel(x, y) == color)
    }

    #[test]
    fn test_identified_caption_is_drawn_above_box() {
        let mut image = RgbImage::new(160, 100);
        let identified = FaceAnnotation {
            region: BoundingBox::new(4.0, 60.0, 30.0, 30.0, 0.9),
            label: FaceLabel::Identified {
                id: IdentityId(1),
                name: "Noor".into(),
                visits: 1,
                rewards: 20,
                distance: 0.2,
            },
        };
        draw_annotations(&mut image, &[identified]);
        // Three caption lines fill the rows above the box.
        assert!(has_color(&image, 6..24, IDENTIFIED_COLOR));
        assert!(has_color(&image, 24..42, IDENTIFIED_COLOR));
        assert!(has_color(&image, 42..60, IDENTIFIED_COLOR));
        assert!(!has_color(&image, 0..6, IDENTIFIED_COLOR));
    }

    #[test]
    fn test_caption_moves_below_box_at_top_edge() {
        let mut image = RgbImage::new(64, 64);
        let unknown = FaceAnnotation {
            region: BoundingBox::new(0.0, 0.0, 20.0, 20.0, 0.9),
            label: FaceLabel::Unknown,
        };
        draw_annotations(&mut image, &[unknown]);
        assert!(has_color(&image, 22..40, UNKNOWN_COLOR));
    }

    #[test]
    fn test_outline_has_no_caption() {
        let mut image = RgbImage::new(64, 64);
        let outline = FaceAnnotation {
            region: BoundingBox::new(4.0, 40.0, 20.0, 20.0, 0.9),
            label: FaceLabel::Outline,
        };
        draw_annotations(&mut image, &[outline]);
        assert!(!has_color(&image, 0..40, OUTLINE_COLOR));
    }

    #[test]
    fn test_draw_ignores_offscreen_faces() {
        let mut image = RgbImage::new(8, 8);
        let offscreen = FaceAnnotation {
            region: BoundingBox::new(50.0, 50.0, 10.0, 10.0, 0.9),
            label: FaceLabel::Outline,
        };
        draw_annotations(&mut image, &[offscreen]);
        assert!(image.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }

    #[test]
    fn test_encode_jpeg_magic() {
        let image = RgbImage::from_pixel(16, 16, Rgb([10, 20, 30]));
        let jpeg = encode_jpeg(&image, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_label_json_shape() {
        let json = serde_json::to_value(annotation(FaceLabel::Unknown)).unwrap();
        assert_eq!(json["label"]["kind"], "unknown");
        assert_eq!(json["region"]["width"], 10.0);
    }
}
