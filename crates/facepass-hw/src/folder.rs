//! Frame source replaying image files from a directory.

use facepass_core::pipeline::{FrameSource, SourceError};
use image::RgbImage;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

/// Yields every image in a directory once, in lexical file-name order.
pub struct ImageFolderSource {
    pending: VecDeque<PathBuf>,
}

impl ImageFolderSource {
    pub fn open(dir: &Path) -> Result<Self, SourceError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| SourceError::Unavailable(format!("{}: {e}", dir.display())))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && has_image_extension(path))
            .collect();
        paths.sort();

        tracing::info!(dir = %dir.display(), images = paths.len(), "opened image folder");
        Ok(Self {
            pending: paths.into(),
        })
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl FrameSource for ImageFolderSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
        let Some(path) = self.pending.pop_front() else {
            return Ok(None);
        };
        let image = image::open(&path)
            .map_err(|e| SourceError::Capture(format!("{}: {e}", path.display())))?;
        Ok(Some(image.to_rgb8()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn write_png(dir: &Path, name: &str, shade: u8) {
        RgbImage::from_pixel(4, 4, Rgb([shade, shade, shade]))
            .save(dir.join(name))
            .unwrap();
    }

    #[test]
    fn test_lexical_order_and_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "b.png", 20);
        write_png(dir.path(), "a.png", 10);
        write_png(dir.path(), "c.PNG", 30);
        std::fs::write(dir.path().join("notes.txt"), "skip me").unwrap();

        let mut source = ImageFolderSource::open(dir.path()).unwrap();
        assert_eq!(source.remaining(), 3);

        let shades: Vec<u8> = std::iter::from_fn(|| source.next_frame().unwrap())
            .map(|img| img.get_pixel(0, 0).0[0])
            .collect();
        assert_eq!(shades, vec![10, 20, 30]);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_missing_dir_is_unavailable() {
        assert!(matches!(
            ImageFolderSource::open(Path::new("/nonexistent/facepass-frames")),
            Err(SourceError::Unavailable(_))
        ));
    }

    #[test]
    fn test_corrupt_file_is_capture_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.jpg"), b"not a jpeg").unwrap();
        let mut source = ImageFolderSource::open(dir.path()).unwrap();
        assert!(matches!(source.next_frame(), Err(SourceError::Capture(_))));
    }
}
