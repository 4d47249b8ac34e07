//! facepass-hw: camera capture and frame sources.
//!
//! V4L2 capture with exclusive per-device leases, pixel format conversion
//! to RGB, and an image-folder source for offline runs.

pub mod camera;
pub mod folder;
pub mod frame;
pub mod lease;

pub use camera::{Camera, CameraError, CameraSource, DeviceInfo, PixelFormat};
pub use folder::ImageFolderSource;
pub use lease::DeviceLease;
