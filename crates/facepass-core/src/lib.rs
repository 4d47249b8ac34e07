//! facepass-core: face identity matching and visit tracking.
//!
//! SCRFD finds faces and ArcFace embeds them, both via ONNX Runtime. The
//! gallery holds enrolled embeddings backed by SQLite, the matcher finds
//! the closest one under a threshold, and the ledger turns matches into
//! daily-capped visits and rewards. `pipeline` runs all of it over a live
//! frame source.

pub mod alignment;
pub mod annotate;
pub mod clock;
pub mod detector;
pub mod enroll;
pub mod gallery;
pub mod ledger;
pub mod matcher;
pub mod mjpeg;
pub mod pipeline;
pub mod recognizer;
pub mod store;
pub mod types;

#[cfg(test)]
mod test_support;

pub use annotate::{EncodedFrame, FaceAnnotation, FaceLabel};
pub use clock::{Clock, LocalClock};
pub use detector::{shared, Detector, DetectorError, OnnxDetector, SharedDetector};
pub use enroll::{EnrollError, Enroller};
pub use gallery::{EmbeddingGallery, GalleryError};
pub use ledger::{LedgerError, VisitLedger, VisitOutcome};
pub use matcher::{LinearMatcher, Matcher};
pub use mjpeg::MjpegWriter;
pub use pipeline::{
    FrameSource, SourceError, StreamCanceller, StreamFault, StreamMode, StreamPipeline, StreamSession,
    StreamState,
};
pub use store::{IdentityStore, SqliteStore, StoreError};
pub use types::{
    BoundingBox, DistanceMetric, Embedding, GalleryEntry, Identity, IdentityDraft, IdentityId, IdentitySummary,
    MatchResult,
};
