use facepass_core::DistanceMetric;
use std::path::PathBuf;
use std::time::Duration;

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video2). A directory is replayed as
    /// an image folder instead.
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Matching metric. `None` uses the embedder's reference metric.
    pub metric: Option<DistanceMetric>,
    /// Largest distance that still counts as a match. `None` uses the
    /// reference threshold of the chosen metric.
    pub match_threshold: Option<f32>,
    /// Longest wait for a single camera frame.
    pub frame_timeout: Duration,
    pub jpeg_quality: u8,
    /// Number of warmup frames to discard after opening the camera (AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Number of frames to capture per camera enrollment.
    pub frames_per_enroll: usize,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `FACEPASS_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facepass");

        let model_dir = var("FACEPASS_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("models"));

        let db_path = var("FACEPASS_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("identities.db"));

        Self {
            camera_device: var("FACEPASS_CAMERA_DEVICE").unwrap_or_else(|| "/dev/video2".to_string()),
            camera_width: parsed(&var, "FACEPASS_CAMERA_WIDTH", 640),
            camera_height: parsed(&var, "FACEPASS_CAMERA_HEIGHT", 480),
            model_dir,
            db_path,
            metric: optional(&var, "FACEPASS_DISTANCE_METRIC"),
            match_threshold: optional(&var, "FACEPASS_MATCH_THRESHOLD"),
            frame_timeout: Duration::from_millis(parsed(&var, "FACEPASS_FRAME_TIMEOUT_MS", 2000)),
            jpeg_quality: parsed::<u8>(&var, "FACEPASS_JPEG_QUALITY", 80).clamp(1, 100),
            warmup_frames: parsed(&var, "FACEPASS_WARMUP_FRAMES", 4),
            frames_per_enroll: parsed(&var, "FACEPASS_FRAMES_PER_ENROLL", 10),
            bus: match var("FACEPASS_BUS").as_deref() {
                Some("system") => BusKind::System,
                _ => BusKind::Session,
            },
        }
    }

    /// Metric and threshold the matcher runs with, given the metric the
    /// loaded embedder was trained for.
    pub fn match_settings(&self, reference: DistanceMetric) -> (DistanceMetric, f32) {
        let metric = self.metric.unwrap_or(reference);
        (metric, self.match_threshold.unwrap_or_else(|| metric.default_threshold()))
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir.join("det_10g.onnx").to_string_lossy().into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir.join("w600k_r50.onnx").to_string_lossy().into_owned()
    }
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match var(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting");
            default
        }),
        None => default,
    }
}

fn optional<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}
