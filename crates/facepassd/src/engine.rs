use crate::config::Config;
use facepass_core::{
    EmbeddingGallery, EnrollError, Enroller, GalleryError, Identity, IdentityId, IdentitySummary, LinearMatcher,
    MjpegWriter, SourceError, StreamCanceller, StreamFault, StreamMode, StreamPipeline, StreamState, VisitLedger,
};
use facepass_hw::{CameraError, CameraSource, ImageFolderSource};
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    Enroll(#[from] EnrollError),
    #[error("{0}")]
    Gallery(#[from] GalleryError),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("stream error: {0}")]
    Stream(#[from] StreamFault),
    #[error("a stream is already running ({0})")]
    StreamActive(Uuid),
    #[error("cannot open output {path}: {source}")]
    Output {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Snapshot of the daemon for `Status`.
#[derive(Debug, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub identities: usize,
    pub camera: String,
    pub metric: String,
    pub threshold: f32,
    pub stream: Option<StreamStatus>,
}

#[derive(Debug, Serialize)]
pub struct StreamStatus {
    pub id: Uuid,
    pub mode: StreamMode,
    pub state: StreamState,
    pub output: PathBuf,
    pub frames_written: u64,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        name: String,
        email: String,
        paths: Vec<PathBuf>,
        reply: oneshot::Sender<Result<IdentityId, EngineError>>,
    },
    EnrollFromCamera {
        name: String,
        email: String,
        reply: oneshot::Sender<Result<IdentityId, EngineError>>,
    },
    List {
        reply: oneshot::Sender<Result<Vec<IdentitySummary>, EngineError>>,
    },
    Get {
        id: IdentityId,
        reply: oneshot::Sender<Result<Identity, EngineError>>,
    },
    Remove {
        name: String,
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    StartStream {
        mode: StreamMode,
        output: PathBuf,
        reply: oneshot::Sender<Result<Uuid, EngineError>>,
    },
    StopStream {
        reply: oneshot::Sender<Option<StreamState>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn enroll(&self, name: String, email: String, paths: Vec<PathBuf>) -> Result<IdentityId, EngineError> {
        self.request(|reply| EngineRequest::Enroll {
            name,
            email,
            paths,
            reply,
        })
        .await?
    }

    pub async fn enroll_from_camera(&self, name: String, email: String) -> Result<IdentityId, EngineError> {
        self.request(|reply| EngineRequest::EnrollFromCamera { name, email, reply })
            .await?
    }

    pub async fn list(&self) -> Result<Vec<IdentitySummary>, EngineError> {
        self.request(|reply| EngineRequest::List { reply }).await?
    }

    pub async fn get(&self, id: IdentityId) -> Result<Identity, EngineError> {
        self.request(|reply| EngineRequest::Get { id, reply }).await?
    }

    pub async fn remove(&self, name: String) -> Result<usize, EngineError> {
        self.request(|reply| EngineRequest::Remove { name, reply }).await?
    }

    pub async fn start_stream(&self, mode: StreamMode, output: PathBuf) -> Result<Uuid, EngineError> {
        self.request(|reply| EngineRequest::StartStream { mode, output, reply })
            .await?
    }

    /// Stop the running stream; `None` if nothing was running.
    pub async fn stop_stream(&self) -> Result<Option<StreamState>, EngineError> {
        self.request(|reply| EngineRequest::StopStream { reply }).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }
}

/// A stream session and the thread draining it into the output file.
struct ActiveStream {
    id: Uuid,
    mode: StreamMode,
    output: PathBuf,
    canceller: StreamCanceller,
    state: watch::Receiver<StreamState>,
    frames_written: Arc<AtomicU64>,
    sink: Option<JoinHandle<()>>,
}

impl ActiveStream {
    fn state(&self) -> StreamState {
        self.state.borrow().clone()
    }

    fn stop(mut self) -> StreamState {
        self.canceller.cancel();
        if let Some(sink) = self.sink.take() {
            if sink.join().is_err() {
                tracing::error!(session = %self.id, "stream sink thread panicked");
            }
        }
        let state = self.state();
        tracing::info!(
            session = %self.id,
            frames = self.frames_written.load(Ordering::Relaxed),
            state = %state,
            "stream stopped"
        );
        state
    }

    fn status(&self) -> StreamStatus {
        StreamStatus {
            id: self.id,
            mode: self.mode,
            state: self.state(),
            output: self.output.clone(),
            frames_written: self.frames_written.load(Ordering::Relaxed),
        }
    }
}

/// Where stream frames come from: a V4L2 device, or a directory of images.
#[derive(Debug, Clone)]
enum StreamInput {
    Camera {
        device: String,
        width: u32,
        height: u32,
        timeout: std::time::Duration,
        warmup: usize,
    },
    Folder(PathBuf),
}

impl StreamInput {
    fn from_config(config: &Config) -> Self {
        let path = Path::new(&config.camera_device);
        if path.is_dir() {
            StreamInput::Folder(path.to_path_buf())
        } else {
            StreamInput::Camera {
                device: config.camera_device.clone(),
                width: config.camera_width,
                height: config.camera_height,
                timeout: config.frame_timeout,
                warmup: config.warmup_frames,
            }
        }
    }
}

fn open_camera(
    device: &str,
    width: u32,
    height: u32,
    timeout: std::time::Duration,
    warmup: usize,
) -> Result<CameraSource, CameraError> {
    let mut source = CameraSource::open(device, width, height, timeout)?;
    if warmup > 0 {
        tracing::debug!(count = warmup, "discarding warmup frames");
        source.warm_up(warmup)?;
    }
    Ok(source)
}

struct Engine {
    config: Config,
    gallery: Arc<EmbeddingGallery>,
    ledger: Arc<VisitLedger>,
    matcher: Arc<LinearMatcher>,
    enroller: Enroller,
    pipeline: StreamPipeline,
    active: Option<ActiveStream>,
}

/// Spawn the engine on a dedicated OS thread.
///
/// All blocking work (inference, capture, SQLite) runs there; D-Bus
/// handlers talk to it through [`EngineHandle`].
pub fn spawn_engine(
    config: Config,
    gallery: Arc<EmbeddingGallery>,
    ledger: Arc<VisitLedger>,
    matcher: Arc<LinearMatcher>,
    enroller: Enroller,
    pipeline: StreamPipeline,
) -> std::io::Result<EngineHandle> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    let mut engine = Engine {
        config,
        gallery,
        ledger,
        matcher,
        enroller,
        pipeline,
        active: None,
    };

    std::thread::Builder::new()
        .name("facepass-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                engine.handle(req);
            }
            if let Some(active) = engine.active.take() {
                active.stop();
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

impl Engine {
    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Enroll {
                name,
                email,
                paths,
                reply,
            } => {
                tracing::info!(name = %name, files = paths.len(), "enroll requested");
                let result = self.enroller.enroll_files(&name, &email, &paths).map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::EnrollFromCamera { name, email, reply } => {
                tracing::info!(name = %name, "camera enroll requested");
                let _ = reply.send(self.enroll_from_camera(&name, &email));
            }
            EngineRequest::List { reply } => {
                let _ = reply.send(self.gallery.summaries().map_err(EngineError::from));
            }
            EngineRequest::Get { id, reply } => {
                let _ = reply.send(self.gallery.lookup(id).map_err(EngineError::from));
            }
            EngineRequest::Remove { name, reply } => {
                let _ = reply.send(self.remove(&name));
            }
            EngineRequest::StartStream { mode, output, reply } => {
                let _ = reply.send(self.start_stream(mode, output));
            }
            EngineRequest::StopStream { reply } => {
                let _ = reply.send(self.active.take().map(ActiveStream::stop));
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn remove(&self, name: &str) -> Result<usize, EngineError> {
        let removed = self.gallery.remove(name)?;
        for id in &removed {
            self.ledger.forget(*id);
        }
        Ok(removed.len())
    }

    fn enroll_from_camera(&self, name: &str, email: &str) -> Result<IdentityId, EngineError> {
        let StreamInput::Camera {
            device,
            width,
            height,
            timeout,
            warmup,
        } = StreamInput::from_config(&self.config)
        else {
            return Err(CameraError::DeviceNotFound(format!("{} is not a camera", self.config.camera_device)).into());
        };

        // The lease makes this fail with DeviceBusy while a stream holds the camera.
        let mut source = open_camera(&device, width, height, timeout, warmup)?;
        let (frames, dark_skipped) = source.capture_frames(self.config.frames_per_enroll)?;
        drop(source);
        tracing::debug!(captured = frames.len(), dark_skipped, "enroll: captured frames");

        Ok(self.enroller.enroll(name, email, &frames)?)
    }

    fn start_stream(&mut self, mode: StreamMode, output: PathBuf) -> Result<Uuid, EngineError> {
        if let Some(active) = &self.active {
            if !active.state().is_terminal() {
                return Err(EngineError::StreamActive(active.id));
            }
        }
        if let Some(finished) = self.active.take() {
            finished.stop();
        }

        let file = File::create(&output).map_err(|source| EngineError::Output {
            path: output.clone(),
            source,
        })?;

        let mut session = match StreamInput::from_config(&self.config) {
            StreamInput::Camera {
                device,
                width,
                height,
                timeout,
                warmup,
            } => self.pipeline.start(mode, move || {
                open_camera(&device, width, height, timeout, warmup).map_err(SourceError::from)
            })?,
            StreamInput::Folder(dir) => self.pipeline.start(mode, move || ImageFolderSource::open(&dir))?,
        };

        let id = session.id();
        let canceller = session.canceller();
        let state = session.state_watch();
        let frames_written = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&frames_written);

        let sink = std::thread::Builder::new()
            .name("facepass-sink".into())
            .spawn(move || {
                let mut writer = MjpegWriter::new(BufWriter::new(file));
                while let Some(item) = session.blocking_next_frame() {
                    match item {
                        Ok(frame) => {
                            if let Err(e) = writer.write_frame(&frame) {
                                tracing::error!(session = %id, error = %e, "output write failed; stopping stream");
                                session.cancel();
                                break;
                            }
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(fault) => {
                            tracing::error!(session = %id, error = %fault, "stream faulted");
                            break;
                        }
                    }
                }
                session.stop();
            })
            .map_err(StreamFault::Spawn)?;

        tracing::info!(session = %id, %mode, output = %output.display(), "stream started");
        self.active = Some(ActiveStream {
            id,
            mode,
            output,
            canceller,
            state,
            frames_written,
            sink: Some(sink),
        });
        Ok(id)
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            version: env!("CARGO_PKG_VERSION"),
            identities: self.gallery.len(),
            camera: self.config.camera_device.clone(),
            metric: self.matcher.metric().to_string(),
            threshold: self.matcher.threshold(),
            stream: self.active.as_ref().map(ActiveStream::status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusKind;
    use facepass_core::detector::{shared, Detector, DetectorError};
    use facepass_core::{BoundingBox, DistanceMetric, Embedding, SqliteStore};
    use image::{Rgb, RgbImage};
    use std::time::Duration;

    /// Sees one face in any frame whose top-left pixel is not black.
    struct CornerDetector;

    impl Detector for CornerDetector {
        fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            if image.get_pixel(0, 0).0 == [0, 0, 0] {
                return Ok(Vec::new());
            }
            Ok(vec![BoundingBox::new(0.0, 0.0, image.width() as f32, image.height() as f32, 0.9)])
        }

        fn embed(&mut self, image: &RgbImage, _face: &BoundingBox) -> Result<Embedding, DetectorError> {
            let Rgb([r, g, b]) = *image.get_pixel(0, 0);
            Ok(Embedding::new(vec![r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0]))
        }

        fn embedding_dim(&self) -> usize {
            3
        }
    }

    fn test_config(source: &Path, data: &Path) -> Config {
        Config {
            camera_device: source.to_string_lossy().into_owned(),
            camera_width: 640,
            camera_height: 480,
            model_dir: data.join("models"),
            db_path: data.join("identities.db"),
            metric: Some(DistanceMetric::Euclidean),
            match_threshold: Some(0.6),
            frame_timeout: Duration::from_secs(2),
            jpeg_quality: 80,
            warmup_frames: 0,
            frames_per_enroll: 10,
            bus: BusKind::Session,
        }
    }

    fn engine(config: Config) -> EngineHandle {
        engine_with_ledger(config).0
    }

    fn engine_with_ledger(config: Config) -> (EngineHandle, Arc<VisitLedger>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let gallery = Arc::new(EmbeddingGallery::load(store.clone(), 3).unwrap());
        let detector = shared(CornerDetector);
        let (metric, threshold) = config.match_settings(CornerDetector.reference_metric());
        let matcher = Arc::new(LinearMatcher::new(metric, threshold));
        let ledger = Arc::new(VisitLedger::new(store));
        let enroller = Enroller::new(detector.clone(), gallery.clone());
        let pipeline = StreamPipeline::new(detector, gallery.clone(), matcher.clone(), ledger.clone());
        let handle = spawn_engine(config, gallery, ledger.clone(), matcher, enroller, pipeline).unwrap();
        (handle, ledger)
    }

    fn write_frames(dir: &Path, colors: &[[u8; 3]]) -> Vec<PathBuf> {
        colors
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let path = dir.join(format!("{i:03}.png"));
                RgbImage::from_pixel(8, 8, Rgb(c)).save(&path).unwrap();
                path
            })
            .collect()
    }

    async fn wait_for_end(handle: &EngineHandle) -> StreamStatus {
        for _ in 0..200 {
            let status = handle.status().await.unwrap();
            let stream = status.stream.unwrap();
            if stream.state.is_terminal() {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("stream did not finish");
    }

    #[test]
    fn test_stream_input_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path(), dir.path());
        assert!(matches!(StreamInput::from_config(&cfg), StreamInput::Folder(_)));

        let cfg = test_config(Path::new("/dev/video2"), dir.path());
        assert!(matches!(StreamInput::from_config(&cfg), StreamInput::Camera { .. }));
    }

    #[tokio::test]
    async fn test_enroll_list_show_remove() {
        let frames = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let paths = write_frames(frames.path(), &[[200, 10, 10], [0, 0, 0]]);
        let handle = engine(test_config(frames.path(), data.path()));

        let id = handle
            .enroll("ana".into(), "ana@example.com".into(), paths.clone())
            .await
            .unwrap();
        let listed = handle.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(handle.get(id).await.unwrap().email, "ana@example.com");

        assert_eq!(handle.remove("ana".into()).await.unwrap(), 1);
        assert!(handle.list().await.unwrap().is_empty());
        assert!(matches!(handle.get(id).await, Err(EngineError::Gallery(_))));
    }

    #[tokio::test]
    async fn test_remove_releases_ledger_slots() {
        let frames = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let paths = write_frames(frames.path(), &[[200, 10, 10]]);
        let (handle, ledger) = engine_with_ledger(test_config(frames.path(), data.path()));

        let id = handle.enroll("ana".into(), String::new(), paths).await.unwrap();
        let today = chrono::Local::now().date_naive();
        ledger.record_visit(id, today).unwrap();
        assert_eq!(ledger.tracked(), 1);

        assert_eq!(handle.remove("ana".into()).await.unwrap(), 1);
        assert_eq!(ledger.tracked(), 0);
    }

    #[tokio::test]
    async fn test_enroll_without_faces_is_reported() {
        let frames = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let paths = write_frames(frames.path(), &[[0, 0, 0]]);
        let handle = engine(test_config(frames.path(), data.path()));

        let err = handle.enroll("ghost".into(), String::new(), paths).await.unwrap_err();
        assert!(matches!(err, EngineError::Enroll(EnrollError::NoFaceDetected)));
    }

    #[tokio::test]
    async fn test_folder_stream_writes_every_frame() {
        let frames = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let paths = write_frames(frames.path(), &[[200, 10, 10], [10, 200, 10], [0, 0, 0]]);
        let handle = engine(test_config(frames.path(), data.path()));
        handle.enroll("ana".into(), String::new(), paths[..1].to_vec()).await.unwrap();

        let output = data.path().join("out.mjpeg");
        let id = handle.start_stream(StreamMode::Recognition, output.clone()).await.unwrap();

        let stream = wait_for_end(&handle).await;
        assert_eq!(stream.id, id);
        assert_eq!(stream.state, StreamState::Stopped);

        // The sink may still be flushing the last part when the state flips.
        assert_eq!(handle.stop_stream().await.unwrap(), Some(StreamState::Stopped));
        let bytes = std::fs::read(&output).unwrap();
        let parts = bytes.windows(8).filter(|w| w == b"--frame\r").count();
        assert_eq!(parts, 3);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("\"name\":\"ana\""));

        let ana = &handle.list().await.unwrap()[0];
        assert_eq!((ana.visits, ana.rewards), (1, 20));
    }

    #[tokio::test]
    async fn test_stop_without_stream() {
        let dir = tempfile::tempdir().unwrap();
        let handle = engine(test_config(dir.path(), dir.path()));
        assert_eq!(handle.stop_stream().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unwritable_output_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let handle = engine(test_config(dir.path(), dir.path()));
        let err = handle
            .start_stream(StreamMode::Enrollment, dir.path().join("missing/out.mjpeg"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Output { .. }));
        assert!(handle.status().await.unwrap().stream.is_none());
    }
}
