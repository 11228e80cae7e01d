//! PiVision - Edge Camera Activity Detection Daemon
//!
//! Main entry point: opens the database, spawns the analysis workers, the
//! stale-job reclaimer and the retention scheduler, then waits for ctrl-c.

use pivision::{
    analysis_worker::{AnalysisWorker, AnalysisWorkerConfig},
    baseline_manager::{BaselineManager, BaselineManagerConfig},
    config_store::ConfigStore,
    detector::{Detector, ExternalDetector},
    event_emitter::{EventEmitter, EventEmitterConfig},
    frame_cache::FrameCache,
    ingest::IngestService,
    interaction_tracker::InteractionTracker,
    job_queue::{JobQueue, JobQueueConfig},
    metrics::MetricsService,
    retention::{RetentionConfig, RetentionJob},
    state::{AppConfig, AppState},
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pivision=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting PiVision v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        database_url = %config.database_url,
        data_dir = %config.data_dir.display(),
        worker_count = config.worker_count,
        "Configuration loaded"
    );

    tokio::fs::create_dir_all(&config.staging_dir).await?;
    tokio::fs::create_dir_all(&config.events_dir).await?;
    tokio::fs::create_dir_all(&config.baseline_dir).await?;

    // Create database pool
    let connect_options = SqliteConnectOptions::from_str(&config.database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(connect_options)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("Database connected, migrations applied");

    // Initialize components
    let config_store = ConfigStore::new(pool.clone());
    let queue = JobQueue::new(pool.clone(), JobQueueConfig::default());
    let ingest = IngestService::new(
        pool.clone(),
        config_store.clone(),
        queue.clone(),
        config.staging_dir.clone(),
        config.device_key.clone(),
    );
    let frame_cache = Arc::new(FrameCache::with_defaults());
    let baseline = Arc::new(BaselineManager::new(BaselineManagerConfig {
        persist_dir: Some(config.baseline_dir.clone()),
    }));
    let tracker = Arc::new(InteractionTracker::new());

    let detector = match &config.detector_url {
        Some(url) => {
            tracing::info!(detector_url = %url, "External detector enabled");
            Detector::External(ExternalDetector::new(url.clone()))
        }
        None => Detector::Noop,
    };
    let emitter = Arc::new(EventEmitter::new(
        pool.clone(),
        EventEmitterConfig {
            events_dir: config.events_dir.clone(),
        },
        detector,
    ));
    let metrics = MetricsService::new(pool.clone());

    let state = AppState {
        pool: pool.clone(),
        config: config.clone(),
        config_store: config_store.clone(),
        queue: queue.clone(),
        ingest,
        frame_cache: frame_cache.clone(),
        baseline: baseline.clone(),
        tracker: tracker.clone(),
        emitter: emitter.clone(),
        metrics,
    };
    tracing::info!("Components initialized");

    // Spawn analysis workers
    let mut workers = Vec::new();
    for _ in 0..config.worker_count {
        let worker = Arc::new(AnalysisWorker::new(
            uuid::Uuid::new_v4().to_string(),
            pool.clone(),
            queue.clone(),
            config_store.clone(),
            frame_cache.clone(),
            baseline.clone(),
            tracker.clone(),
            emitter.clone(),
            AnalysisWorkerConfig::default(),
        ));
        worker.clone().start().await;
        workers.push(worker);
    }

    // Stale-job reclaimer: crash recovery for abandoned running jobs
    {
        let queue = queue.clone();
        let interval_s = config.reclaim_interval_s;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_s));
            loop {
                interval.tick().await;
                if let Err(e) = queue.reclaim_stale(chrono::Utc::now()).await {
                    tracing::error!(error = %e, "Stale job reclaim failed");
                }
            }
        });
    }

    // Retention scheduler
    let retention = Arc::new(RetentionJob::new(
        pool.clone(),
        queue.clone(),
        RetentionConfig {
            events_dir: config.events_dir.clone(),
            ..RetentionConfig::default()
        },
    ));
    retention.clone().start().await;

    let depth = state.queue.depth().await?;
    tracing::info!(
        queued = depth.queued,
        running = depth.running,
        dead = depth.dead,
        "Pipeline running"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    for worker in &workers {
        worker.stop().await;
    }
    retention.stop().await;
    Ok(())
}
