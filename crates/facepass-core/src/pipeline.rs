//! Live stream processing: detect, identify, record visits, annotate, encode.
//!
//! A session owns its frame source on a dedicated thread. Processed frames
//! flow to the consumer through a bounded channel of depth one, so a slow
//! consumer throttles capture instead of queueing frames.

use crate::annotate::{draw_annotations, encode_jpeg, EncodedFrame, FaceAnnotation, FaceLabel};
use crate::clock::{Clock, LocalClock};
use crate::detector::{DetectorError, SharedDetector};
use crate::gallery::EmbeddingGallery;
use crate::ledger::{LedgerError, VisitLedger};
use crate::matcher::Matcher;
use crate::types::{BoundingBox, Embedding, GalleryEntry, MatchResult};
use chrono::NaiveDate;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// A producer of RGB frames, such as a camera or an image folder.
pub trait FrameSource {
    /// Next frame, or `Ok(None)` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<RgbImage>, SourceError>;
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("frame source unavailable: {0}")]
    Unavailable(String),
    #[error("frame source busy: {0}")]
    Busy(String),
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("capture failed: {0}")]
    Capture(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Identify faces and record visits.
    Recognition,
    /// Outline faces only; the ledger is never touched.
    Enrollment,
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamMode::Recognition => f.write_str("recognition"),
            StreamMode::Enrollment => f.write_str("enrollment"),
        }
    }
}

impl FromStr for StreamMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "recognition" | "recognize" => Ok(StreamMode::Recognition),
            "enrollment" | "enroll" => Ok(StreamMode::Enrollment),
            other => Err(format!("unknown stream mode '{other}' (expected recognition or enrollment)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum StreamState {
    Idle,
    Streaming,
    Stopped,
    Faulted(String),
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamState::Stopped | StreamState::Faulted(_))
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::Idle => f.write_str("idle"),
            StreamState::Streaming => f.write_str("streaming"),
            StreamState::Stopped => f.write_str("stopped"),
            StreamState::Faulted(reason) => write!(f, "faulted: {reason}"),
        }
    }
}

/// Unrecoverable error that ends a session.
#[derive(Error, Debug)]
pub enum StreamFault {
    #[error("source: {0}")]
    Source(#[from] SourceError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
    #[error("encode: {0}")]
    Encode(#[from] image::ImageError),
    #[error("failed to spawn stream thread: {0}")]
    Spawn(std::io::Error),
}

type FrameResult = Result<EncodedFrame, StreamFault>;

/// Everything a session needs, cheap to clone into its thread.
#[derive(Clone)]
pub struct StreamPipeline {
    detector: SharedDetector,
    gallery: Arc<EmbeddingGallery>,
    matcher: Arc<dyn Matcher>,
    ledger: Arc<VisitLedger>,
    clock: Arc<dyn Clock>,
    jpeg_quality: u8,
}

impl StreamPipeline {
    pub fn new(
        detector: SharedDetector,
        gallery: Arc<EmbeddingGallery>,
        matcher: Arc<dyn Matcher>,
        ledger: Arc<VisitLedger>,
    ) -> Self {
        Self {
            detector,
            gallery,
            matcher,
            ledger,
            clock: Arc::new(LocalClock),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality;
        self
    }

    /// Start a session. `open` runs on the session thread; the source it
    /// returns lives and dies there.
    pub fn start<S, F>(&self, mode: StreamMode, open: F) -> Result<StreamSession, StreamFault>
    where
        S: FrameSource,
        F: FnOnce() -> Result<S, SourceError> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let (frame_tx, frame_rx) = mpsc::channel::<FrameResult>(1);
        let (state_tx, state_rx) = watch::channel(StreamState::Idle);
        let cancel = Arc::new(AtomicBool::new(false));

        let pipeline = self.clone();
        let thread_cancel = Arc::clone(&cancel);
        let handle = std::thread::Builder::new()
            .name(format!("facepass-stream-{}", &id.simple().to_string()[..8]))
            .spawn(move || {
                let span = tracing::info_span!("stream", session = %id, %mode);
                let _enter = span.enter();
                let final_state = pipeline.run(mode, open, &frame_tx, &state_tx, &thread_cancel);
                state_tx.send_replace(final_state);
            })
            .map_err(StreamFault::Spawn)?;

        Ok(StreamSession {
            id,
            mode,
            frames: frame_rx,
            state: state_rx,
            cancel,
            thread: Some(handle),
        })
    }

    fn run<S, F>(
        &self,
        mode: StreamMode,
        open: F,
        frames: &mpsc::Sender<FrameResult>,
        state: &watch::Sender<StreamState>,
        cancel: &AtomicBool,
    ) -> StreamState
    where
        S: FrameSource,
        F: FnOnce() -> Result<S, SourceError>,
    {
        let mut source = match open() {
            Ok(source) => source,
            Err(e) => return fault(frames, state, e.into()),
        };
        state.send_replace(StreamState::Streaming);
        tracing::info!("stream started");

        let mut sequence = 0u64;
        loop {
            if cancel.load(Ordering::Acquire) || frames.is_closed() {
                tracing::info!(frames = sequence, "stream stopped by consumer");
                return StreamState::Stopped;
            }

            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::info!(frames = sequence, "frame source exhausted");
                    return StreamState::Stopped;
                }
                Err(e) => return fault(frames, state, e.into()),
            };

            let encoded = match self.process_frame(mode, frame, sequence) {
                Ok(encoded) => encoded,
                Err(e) => return fault(frames, state, e),
            };

            if frames.blocking_send(Ok(encoded)).is_err() {
                tracing::info!(frames = sequence, "consumer went away");
                return StreamState::Stopped;
            }
            sequence += 1;
        }
    }

    /// Run one frame through the pipeline and encode the annotated result.
    pub fn process_frame(
        &self,
        mode: StreamMode,
        mut frame: RgbImage,
        sequence: u64,
    ) -> Result<EncodedFrame, StreamFault> {
        let faces = self.detect_faces(mode, &frame)?;

        let annotations = match mode {
            StreamMode::Enrollment => faces
                .into_iter()
                .map(|(region, _)| FaceAnnotation {
                    region,
                    label: FaceLabel::Outline,
                })
                .collect(),
            StreamMode::Recognition => {
                let snapshot = self.gallery.all();
                let today = self.clock.today();
                let mut annotations = Vec::with_capacity(faces.len());
                for (region, embedding) in faces {
                    let label = match embedding {
                        Some(embedding) => self.label_face(&embedding, &snapshot, today)?,
                        None => FaceLabel::Unknown,
                    };
                    annotations.push(FaceAnnotation { region, label });
                }
                annotations
            }
        };

        draw_annotations(&mut frame, &annotations);
        let jpeg = encode_jpeg(&frame, self.jpeg_quality)?;
        tracing::trace!(sequence, faces = annotations.len(), "frame processed");

        Ok(EncodedFrame {
            sequence,
            jpeg,
            annotations,
        })
    }

    /// Detection and, in recognition mode, embedding under one detector lock.
    fn detect_faces(
        &self,
        mode: StreamMode,
        frame: &RgbImage,
    ) -> Result<Vec<(BoundingBox, Option<Embedding>)>, StreamFault> {
        let mut detector = self.detector.lock().map_err(|_| DetectorError::Poisoned)?;
        let faces = detector.detect(frame)?;
        if mode == StreamMode::Enrollment {
            return Ok(faces.into_iter().map(|face| (face, None)).collect());
        }

        let mut embedded = Vec::with_capacity(faces.len());
        for face in faces {
            let embedding = match detector.embed(frame, &face) {
                Ok(embedding) => Some(embedding),
                Err(e) => {
                    tracing::warn!(error = %e, x = face.x, y = face.y, "could not embed face, labelling it unknown");
                    None
                }
            };
            embedded.push((face, embedding));
        }
        Ok(embedded)
    }

    fn label_face(
        &self,
        embedding: &Embedding,
        snapshot: &[GalleryEntry],
        today: NaiveDate,
    ) -> Result<FaceLabel, StreamFault> {
        let MatchResult::Identified { id, distance } = self.matcher.compare(embedding, snapshot) else {
            return Ok(FaceLabel::Unknown);
        };

        match self.ledger.record_visit(id, today) {
            Ok(outcome) => Ok(FaceLabel::Identified {
                id,
                name: outcome.identity.name,
                visits: outcome.identity.visits,
                rewards: outcome.identity.rewards,
                distance,
            }),
            Err(LedgerError::NotFound(_)) => {
                tracing::debug!(id = %id, "matched identity was removed mid-frame");
                Ok(FaceLabel::Unknown)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn fault(
    frames: &mpsc::Sender<FrameResult>,
    state: &watch::Sender<StreamState>,
    fault: StreamFault,
) -> StreamState {
    tracing::error!(error = %fault, "stream faulted");
    let faulted = StreamState::Faulted(fault.to_string());
    state.send_replace(faulted.clone());
    let _ = frames.blocking_send(Err(fault));
    faulted
}

/// Cancels a session from another thread.
#[derive(Clone)]
pub struct StreamCanceller(Arc<AtomicBool>);

impl StreamCanceller {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Handle to a running session. Dropping it cancels the session.
pub struct StreamSession {
    id: Uuid,
    mode: StreamMode,
    frames: mpsc::Receiver<FrameResult>,
    state: watch::Receiver<StreamState>,
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl StreamSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    pub fn state(&self) -> StreamState {
        self.state.borrow().clone()
    }

    pub fn state_watch(&self) -> watch::Receiver<StreamState> {
        self.state.clone()
    }

    pub fn canceller(&self) -> StreamCanceller {
        StreamCanceller(Arc::clone(&self.cancel))
    }

    /// Next processed frame. A fault is delivered once, then `None`.
    pub async fn next_frame(&mut self) -> Option<Result<EncodedFrame, StreamFault>> {
        self.frames.recv().await
    }

    /// Blocking variant of [`next_frame`](Self::next_frame); must not be
    /// called from inside an async runtime.
    pub fn blocking_next_frame(&mut self) -> Option<Result<EncodedFrame, StreamFault>> {
        self.frames.blocking_recv()
    }

    /// Ask the session to stop; frames already queued stay readable.
    pub fn cancel(&mut self) {
        self.cancel.store(true, Ordering::Release);
        self.frames.close();
    }

    /// Cancel, wait for the source to be released, and return the final state.
    pub fn stop(mut self) -> StreamState {
        self.cancel();
        while self.frames.try_recv().is_ok() {}
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::error!(session = %self.id, "stream thread panicked");
                return StreamState::Faulted("stream thread panicked".into());
            }
        }
        self.state()
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        self.frames.close();
    }
}
