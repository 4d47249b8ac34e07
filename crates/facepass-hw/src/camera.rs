//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, FrameError};
use crate::lease::DeviceLease;
use facepass_core::pipeline::{FrameSource, SourceError};
use image::RgbImage;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const CAPTURE_BUFFERS: u32 = 4;
const DARK_FRAME_PCT: f32 = 0.95;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("frame conversion failed: {0}")]
    Frame(#[from] FrameError),
}

impl From<CameraError> for SourceError {
    fn from(e: CameraError) -> Self {
        match e {
            CameraError::DeviceNotFound(path) => SourceError::Unavailable(path),
            CameraError::DeviceBusy(path) => SourceError::Busy(path),
            CameraError::Timeout(after) => SourceError::Timeout(after),
            CameraError::StreamingNotSupported => SourceError::Unavailable("streaming not supported".into()),
            other => SourceError::Capture(other.to_string()),
        }
    }
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Motion JPEG, one complete JPEG per buffer.
    Mjpg,
    /// YUYV 4:2:2 packed.
    Yuyv,
    /// 8-bit grayscale, native IR camera output.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"MJPG" => Some(PixelFormat::Mjpg),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"GREY" => Some(PixelFormat::Grey),
            _ => None,
        }
    }
}

/// Converts raw driver buffers to RGB for a negotiated format.
#[derive(Debug, Clone, Copy)]
struct Decoder {
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

impl Decoder {
    fn decode(&self, buf: &[u8]) -> Result<RgbImage, CameraError> {
        let image = match self.pixel_format {
            PixelFormat::Mjpg => frame::mjpeg_to_rgb(buf)?,
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height)?,
            PixelFormat::Grey => frame::grey_to_rgb(buf, self.width, self.height)?,
        };
        Ok(image)
    }
}

/// V4L2 camera device handle. Holds the device lease for its lifetime.
pub struct Camera {
    device: Device,
    decoder: Decoder,
    pub device_path: String,
    pub fourcc: FourCC,
    _lease: DeviceLease,
}

impl Camera {
    /// Open a V4L2 camera (e.g. "/dev/video2") and negotiate MJPG, falling
    /// back to whatever YUYV or GREY format the driver settles on.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let lease = DeviceLease::acquire(device_path)
            .ok_or_else(|| CameraError::DeviceBusy(device_path.to_string()))?;

        let device = Device::with_path(device_path).map_err(|e| {
            if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
                CameraError::DeviceBusy(device_path.to_string())
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"MJPG");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc} (need MJPG, YUYV, or GREY)"
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = %fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            decoder: Decoder {
                width: negotiated.width,
                height: negotiated.height,
                pixel_format,
            },
            device_path: device_path.to_string(),
            fourcc,
            _lease: lease,
        })
    }

    pub fn width(&self) -> u32 {
        self.decoder.width
    }

    pub fn height(&self) -> u32 {
        self.decoder.height
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.decoder.pixel_format
    }

    /// Start streaming. Each dequeue waits at most `timeout`.
    pub fn into_source(self, timeout: Duration) -> Result<CameraSource, CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, CAPTURE_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        stream.set_timeout(timeout);

        Ok(CameraSource {
            stream,
            decoder: self.decoder,
            timeout,
            captured: 0,
            camera: self,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

/// A streaming camera. Dropping it stops the stream and releases the lease.
pub struct CameraSource {
    // Declared before `camera` so the stream is torn down first.
    stream: MmapStream<'static>,
    decoder: Decoder,
    timeout: Duration,
    captured: u64,
    camera: Camera,
}

impl CameraSource {
    pub fn open(device_path: &str, width: u32, height: u32, timeout: Duration) -> Result<Self, CameraError> {
        Camera::open(device_path, width, height)?.into_source(timeout)
    }

    pub fn device_path(&self) -> &str {
        &self.camera.device_path
    }

    pub fn capture(&mut self) -> Result<RgbImage, CameraError> {
        let (buf, meta) = self.stream.next().map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => CameraError::Timeout(self.timeout),
            _ => CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")),
        })?;
        let used = (meta.bytesused as usize).min(buf.len());
        let buf = if used > 0 { &buf[..used] } else { buf };

        let image = self.decoder.decode(buf)?;
        self.captured += 1;
        tracing::trace!(seq = meta.sequence, captured = self.captured, "captured frame");
        Ok(image)
    }

    /// Discard the first frames while auto-exposure settles.
    pub fn warm_up(&mut self, frames: usize) -> Result<(), CameraError> {
        for _ in 0..frames {
            self.capture()?;
        }
        Ok(())
    }

    /// Capture up to `count` non-dark frames, trying at most `count * 3`
    /// times. Returns the frames and how many dark frames were skipped.
    pub fn capture_frames(&mut self, count: usize) -> Result<(Vec<RgbImage>, usize), CameraError> {
        let mut good = Vec::with_capacity(count);
        let mut dark = 0usize;

        for _ in 0..count * 3 {
            if good.len() >= count {
                break;
            }
            let image = self.capture()?;
            if frame::is_dark_frame(&image, DARK_FRAME_PCT) {
                dark += 1;
                tracing::debug!("skipping dark frame");
                continue;
            }
            good.push(image);
        }

        Ok((good, dark))
    }
}

impl FrameSource for CameraSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
        Ok(Some(self.capture()?))
    }
}
