//! Application state
//!
//! Holds configuration and the shared service components

use crate::baseline_manager::BaselineManager;
use crate::config_store::ConfigStore;
use crate::event_emitter::EventEmitter;
use crate::frame_cache::FrameCache;
use crate::ingest::IngestService;
use crate::interaction_tracker::InteractionTracker;
use crate::job_queue::JobQueue;
use crate::metrics::MetricsService;
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Database URL
    pub database_url: String,
    /// Data root
    pub data_dir: PathBuf,
    /// Staging frame directory
    pub staging_dir: PathBuf,
    /// Promoted evidence directory
    pub events_dir: PathBuf,
    /// Persisted baseline directory
    pub baseline_dir: PathBuf,
    /// Shared device key for ingest
    pub device_key: String,
    /// Analysis worker instances
    pub worker_count: usize,
    /// Optional external detector URL
    pub detector_url: Option<String>,
    /// Seconds between stale-job reclaim sweeps
    pub reclaim_interval_s: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"));
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/pivision.db".to_string()),
            staging_dir: data_dir.join("staging"),
            events_dir: data_dir.join("events"),
            baseline_dir: data_dir.join("baselines"),
            data_dir,
            device_key: std::env::var("PIVISION_DEVICE_KEY")
                .unwrap_or_else(|_| "dev-key".to_string()),
            worker_count: std::env::var("WORKER_COUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            detector_url: std::env::var("DETECTOR_URL").ok(),
            reclaim_interval_s: std::env::var("RECLAIM_INTERVAL_S")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
        }
    }
}

/// Application state shared across tasks
#[derive(Clone)]
pub struct AppState {
    /// Database pool
    pub pool: SqlitePool,
    /// Application config
    pub config: AppConfig,
    /// Device config / ROI repository
    pub config_store: ConfigStore,
    /// Durable analysis queue
    pub queue: JobQueue,
    /// Frame intake contract
    pub ingest: IngestService,
    /// Previous-frame cache
    pub frame_cache: Arc<FrameCache>,
    /// Inventory baselines
    pub baseline: Arc<BaselineManager>,
    /// Interaction state machines
    pub tracker: Arc<InteractionTracker>,
    /// Event writer
    pub emitter: Arc<EventEmitter>,
    /// Read-only observability
    pub metrics: MetricsService,
}
