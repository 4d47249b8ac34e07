use crate::engine::{EngineError, EngineHandle};
use facepass_core::{EnrollError, IdentityId, SourceError, StreamFault, StreamMode};
use facepass_hw::CameraError;
use std::path::PathBuf;
use zbus::fdo;
use zbus::interface;

pub const BUS_NAME: &str = "org.facepass.Daemon1";
pub const OBJECT_PATH: &str = "/org/facepass/Daemon1";

/// D-Bus interface for the facepass daemon.
///
/// Bus name: org.facepass.Daemon1
/// Object path: /org/facepass/Daemon1
pub struct FacepassService {
    engine: EngineHandle,
}

impl FacepassService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

#[interface(name = "org.facepass.Daemon1")]
impl FacepassService {
    /// Enroll a new identity from image files readable by the daemon.
    async fn enroll(&self, name: &str, email: &str, paths: Vec<String>) -> fdo::Result<i64> {
        tracing::info!(name, files = paths.len(), "Enroll called");
        let paths = paths.into_iter().map(PathBuf::from).collect();
        let id = self
            .engine
            .enroll(name.to_string(), email.to_string(), paths)
            .await
            .map_err(to_fdo)?;
        Ok(id.0)
    }

    /// Enroll a new identity from frames captured by the daemon's camera.
    async fn enroll_from_camera(&self, name: &str, email: &str) -> fdo::Result<i64> {
        tracing::info!(name, "EnrollFromCamera called");
        let id = self
            .engine
            .enroll_from_camera(name.to_string(), email.to_string())
            .await
            .map_err(to_fdo)?;
        Ok(id.0)
    }

    /// JSON array of identity summaries.
    async fn list_identities(&self) -> fdo::Result<String> {
        let summaries = self.engine.list().await.map_err(to_fdo)?;
        to_json(&summaries)
    }

    /// JSON object with one identity's visit state.
    async fn get_identity(&self, id: i64) -> fdo::Result<String> {
        let identity = self.engine.get(IdentityId(id)).await.map_err(to_fdo)?;
        to_json(&identity)
    }

    /// Remove every identity with this name; returns how many were removed.
    async fn remove_identity(&self, name: &str) -> fdo::Result<u32> {
        tracing::info!(name, "RemoveIdentity called");
        let removed = self.engine.remove(name.to_string()).await.map_err(to_fdo)?;
        Ok(removed as u32)
    }

    /// Start streaming annotated MJPEG into `output_path`; returns the session id.
    async fn start_stream(&self, mode: &str, output_path: &str) -> fdo::Result<String> {
        let mode: StreamMode = mode.parse().map_err(fdo::Error::InvalidArgs)?;
        let output = PathBuf::from(output_path);
        if !output.is_absolute() {
            return Err(fdo::Error::InvalidArgs(format!(
                "output path must be absolute: {output_path}"
            )));
        }
        tracing::info!(%mode, output = output_path, "StartStream called");
        let id = self.engine.start_stream(mode, output).await.map_err(to_fdo)?;
        Ok(id.to_string())
    }

    /// Stop the running stream. False if none was running.
    async fn stop_stream(&self) -> fdo::Result<bool> {
        let stopped = self.engine.stop_stream().await.map_err(to_fdo)?;
        Ok(stopped.is_some())
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        to_json(&status)
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("serialization failed: {e}")))
}

fn to_fdo(e: EngineError) -> fdo::Error {
    let msg = e.to_string();
    let busy = matches!(
        &e,
        EngineError::StreamActive(_)
            | EngineError::Camera(CameraError::DeviceBusy(_))
            | EngineError::Stream(StreamFault::Source(SourceError::Busy(_)))
    );
    if busy {
        return fdo::Error::LimitsExceeded(msg);
    }

    match e {
        EngineError::Enroll(EnrollError::TooManySamples { .. }) => fdo::Error::LimitsExceeded(msg),
        EngineError::Enroll(EnrollError::Gallery(g)) | EngineError::Gallery(g) if g.is_validation() => {
            fdo::Error::InvalidArgs(msg)
        }
        EngineError::Enroll(EnrollError::Gallery(g)) | EngineError::Gallery(g) if g.is_not_found() => {
            fdo::Error::FileNotFound(msg)
        }
        EngineError::Camera(CameraError::DeviceNotFound(_)) => fdo::Error::FileNotFound(msg),
        EngineError::Output { .. } => fdo::Error::IOError(msg),
        _ => fdo::Error::Failed(msg),
    }
}
