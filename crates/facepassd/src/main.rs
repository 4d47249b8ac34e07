use anyhow::{Context, Result};
use facepass_core::{
    shared, Detector, EmbeddingGallery, Enroller, LinearMatcher, OnnxDetector, SqliteStore, StreamPipeline,
    VisitLedger,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{BusKind, Config};
use dbus_interface::{FacepassService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facepassd starting");
    let config = Config::from_env();

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("opening database {}", config.db_path.display()))?,
    );

    // Load models before registering on the bus so a broken install fails fast.
    let detector = OnnxDetector::load(&config.scrfd_model_path(), &config.arcface_model_path())
        .context("loading ONNX models")?;
    let dimension = detector.embedding_dim();
    let (metric, threshold) = config.match_settings(detector.reference_metric());
    let detector = shared(detector);

    let gallery = Arc::new(EmbeddingGallery::load(store.clone(), dimension).context("loading gallery")?);
    tracing::info!(
        identities = gallery.len(),
        db = %config.db_path.display(),
        "gallery loaded"
    );

    let matcher = Arc::new(LinearMatcher::new(metric, threshold));
    tracing::info!(%metric, threshold, "matcher configured");

    let ledger = Arc::new(VisitLedger::new(store));
    let enroller = Enroller::new(detector.clone(), gallery.clone());
    let pipeline = StreamPipeline::new(detector, gallery.clone(), matcher.clone(), ledger.clone())
        .with_jpeg_quality(config.jpeg_quality);

    let bus = config.bus;
    let engine = engine::spawn_engine(config, gallery, ledger, matcher, enroller, pipeline)
        .context("spawning engine thread")?;
    let control = engine.clone();

    let builder = match bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, FacepassService::new(engine))?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = ?bus, name = BUS_NAME, "facepassd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facepassd shutting down");

    // Release the camera and flush the output file before exiting.
    if let Ok(Some(state)) = control.stop_stream().await {
        tracing::info!(state = %state, "stream stopped for shutdown");
    }

    Ok(())
}
