//! Multipart MJPEG framing.
//!
//! Each part carries one JPEG plus an `X-Faces` header holding the frame's
//! annotations as single-line JSON, so consumers can render captions.

use crate::annotate::EncodedFrame;
use std::io::{self, Write};

pub const BOUNDARY: &str = "frame";

/// `Content-Type` of the whole stream.
pub fn content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={BOUNDARY}")
}

pub struct MjpegWriter<W: Write> {
    inner: W,
    parts: u64,
}

impl<W: Write> MjpegWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, parts: 0 }
    }

    pub fn write_frame(&mut self, frame: &EncodedFrame) -> io::Result<()> {
        let faces = serde_json::to_string(&frame.annotations).map_err(io::Error::other)?;
        write!(
            self.inner,
            "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nX-Sequence: {}\r\nX-Faces: {faces}\r\n\r\n",
            frame.jpeg.len(),
            frame.sequence,
        )?;
        self.inner.write_all(&frame.jpeg)?;
        self.inner.write_all(b"\r\n")?;
        self.inner.flush()?;
        self.parts += 1;
        Ok(())
    }

    pub fn parts_written(&self) -> u64 {
        self.parts
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
