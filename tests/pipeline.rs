//! End-to-end pipeline tests: ingest -> queue -> worker -> events ->
//! evidence promotion, over an in-memory database and temp storage.

use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use image::GrayImage;
use pivision::analysis_worker::{AnalysisWorker, AnalysisWorkerConfig};
use pivision::baseline_manager::{BaselineManager, BaselineManagerConfig};
use pivision::config_store::ConfigStore;
use pivision::detector::Detector;
use pivision::event_emitter::{EventEmitter, EventEmitterConfig};
use pivision::frame_cache::FrameCache;
use pivision::ingest::{FramePayload, IngestService};
use pivision::interaction_tracker::InteractionTracker;
use pivision::job_queue::{JobQueue, JobQueueConfig};
use pivision::metrics::MetricsService;
use pivision::models::RoiKind;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

struct Harness {
    pool: SqlitePool,
    config_store: ConfigStore,
    ingest: IngestService,
    worker: AnalysisWorker,
    metrics: MetricsService,
    _tmp: tempfile::TempDir,
}

async fn harness() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let config_store = ConfigStore::new(pool.clone());
    let queue = JobQueue::new(pool.clone(), JobQueueConfig::default());
    let ingest = IngestService::new(
        pool.clone(),
        config_store.clone(),
        queue.clone(),
        tmp.path().join("staging"),
        "dev-key".to_string(),
    );
    let baseline = Arc::new(BaselineManager::new(BaselineManagerConfig {
        persist_dir: None,
    }));
    let emitter = Arc::new(EventEmitter::new(
        pool.clone(),
        EventEmitterConfig {
            events_dir: tmp.path().join("events"),
        },
        Detector::Noop,
    ));
    let worker = AnalysisWorker::new(
        "worker-1".to_string(),
        pool.clone(),
        queue,
        config_store.clone(),
        Arc::new(FrameCache::with_defaults()),
        baseline,
        Arc::new(InteractionTracker::new()),
        emitter,
        AnalysisWorkerConfig::default(),
    );
    let metrics = MetricsService::new(pool.clone());

    Harness {
        pool,
        config_store,
        ingest,
        worker,
        metrics,
        _tmp: tmp,
    }
}

/// Configure a device: thresholds for the concrete scenario plus ROIs
async fn configure_device(h: &Harness, device_id: &str) {
    let now = Utc::now();
    h.config_store
        .touch_device(device_id, "dev-key", now)
        .await
        .unwrap();
    h.config_store
        .update_device_config(device_id, Some(0.3), Some(2), Some(2.0), Some(0.25))
        .await
        .unwrap();
    h.config_store
        .upsert_roi(device_id, "interaction_roi", RoiKind::Interaction, 0.0, 0.0, 1.0, 1.0)
        .await
        .unwrap();
    h.config_store
        .upsert_roi(device_id, "inventory_roi", RoiKind::Inventory, 0.0, 0.0, 1.0, 1.0)
        .await
        .unwrap();
}

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_750_000_000 + secs, 0).unwrap()
}

fn flat(value: u8) -> GrayImage {
    GrayImage::from_pixel(32, 32, image::Luma([value]))
}

/// Left half one value, right half another
fn split(left: u8, right: u8) -> GrayImage {
    GrayImage::from_fn(32, 32, |x, _| {
        if x < 16 {
            image::Luma([left])
        } else {
            image::Luma([right])
        }
    })
}

fn encode(img: &GrayImage) -> String {
    let mut buf = Vec::new();
    img.write_to(
        &mut std::io::Cursor::new(&mut buf),
        image::ImageFormat::Png,
    )
    .unwrap();
    base64::engine::general_purpose::STANDARD.encode(buf)
}

async fn send_frame(h: &Harness, device_id: &str, seq: i64, img: &GrayImage, at: DateTime<Utc>) {
    h.ingest
        .ingest_frame(
            FramePayload {
                device_id: device_id.to_string(),
                capture_ts: Some(at.to_rfc3339()),
                seq,
                width: 32,
                height: 32,
                jpeg_quality: Some(70),
                image_b64: Some(encode(img)),
            },
            at,
        )
        .await
        .unwrap();
}

/// Drain the queue through the worker
async fn drain(h: &Harness) {
    while h.worker.tick().await.unwrap() {}
}

async fn events_of(h: &Harness, device_id: &str) -> Vec<(String, DateTime<Utc>, DateTime<Utc>)> {
    sqlx::query(
        "SELECT event_type, started_at, ended_at FROM events WHERE device_id = ? ORDER BY id",
    )
    .bind(device_id)
    .fetch_all(&h.pool)
    .await
    .unwrap()
    .iter()
    .map(|r| (r.get("event_type"), r.get("started_at"), r.get("ended_at")))
    .collect()
}

async fn storage_class(h: &Harness, device_id: &str, seq: i64) -> String {
    sqlx::query("SELECT storage_class FROM captures WHERE device_id = ? AND seq = ?")
        .bind(device_id)
        .bind(seq)
        .fetch_one(&h.pool)
        .await
        .unwrap()
        .get("storage_class")
}

#[tokio::test]
async fn calm_frames_produce_no_events() {
    let h = harness().await;
    configure_device(&h, "cam-1").await;

    for i in 0..6 {
        send_frame(&h, "cam-1", i, &flat(0), ts(i)).await;
    }
    drain(&h).await;

    assert!(events_of(&h, "cam-1").await.is_empty());

    // everything but the held pre candidate is reclaimed
    let discarded: i64 = sqlx::query(
        "SELECT COUNT(*) AS cnt FROM captures WHERE device_id = 'cam-1' AND storage_class = 'discarded'",
    )
    .fetch_one(&h.pool)
    .await
    .unwrap()
    .get("cnt");
    assert_eq!(discarded, 5);

    let processed: i64 = sqlx::query(
        "SELECT COUNT(*) AS cnt FROM captures WHERE device_id = 'cam-1' AND analysis_status = 'processed'",
    )
    .fetch_one(&h.pool)
    .await
    .unwrap()
    .get("cnt");
    assert_eq!(processed, 6);
}

#[tokio::test]
async fn concrete_scenario_single_interaction() {
    let h = harness().await;
    configure_device(&h, "cam-1").await;

    // motion scores vs previous: [-, 0.5, 0.5, 0.0, 0.0, 0.0]
    let frames = [flat(0), split(255, 0), flat(0), flat(0), flat(0), flat(0)];
    for (i, img) in frames.iter().enumerate() {
        send_frame(&h, "cam-1", i as i64, img, ts(i as i64)).await;
    }
    drain(&h).await;

    let events = events_of(&h, "cam-1").await;
    assert_eq!(events.len(), 1, "expected exactly one event: {:?}", events);
    let (event_type, started_at, ended_at) = &events[0];
    assert_eq!(event_type, "interaction_detected");
    // starts at the first above-threshold frame, ends once the motion has
    // been below threshold for the full end timeout
    assert_eq!(*started_at, ts(1));
    assert_eq!(*ended_at, ts(4));

    // pre/during/post promoted to event storage, the rest reclaimed
    assert_eq!(storage_class(&h, "cam-1", 0).await, "event"); // pre
    assert_eq!(storage_class(&h, "cam-1", 2).await, "event"); // during (peak)
    assert_eq!(storage_class(&h, "cam-1", 3).await, "event"); // post
    assert_eq!(storage_class(&h, "cam-1", 4).await, "discarded");

    let images = h.metrics.recent_events(10).await.unwrap();
    assert_eq!(images.len(), 1);
    let roles: Vec<String> = images[0].images.iter().map(|i| i.role.clone()).collect();
    assert_eq!(roles, vec!["during", "post", "pre"]);
    for image in &images[0].images {
        assert!(std::path::Path::new(&image.path).exists());
    }
}

#[tokio::test]
async fn stock_change_emitted_with_interaction() {
    let h = harness().await;
    configure_device(&h, "cam-2").await;

    // calm frames build the baseline (stability_frames_required = 3), then
    // an interaction that visibly changes the shelf content
    let frames = [
        flat(0),        // t0 cold start
        flat(0),        // t1
        flat(0),        // t2
        flat(0),        // t3 baseline ready
        split(255, 0),  // t4 motion 0.5
        split(0, 255),  // t5 motion 1.0 (peak)
        flat(200),      // t6 motion 0.5
        flat(200),      // t7 below
        flat(200),      // t8 below, timeout reached -> interaction ends
    ];
    for (i, img) in frames.iter().enumerate() {
        send_frame(&h, "cam-2", i as i64, img, ts(i as i64)).await;
    }
    drain(&h).await;

    let events = events_of(&h, "cam-2").await;
    let types: Vec<&str> = events.iter().map(|(t, _, _)| t.as_str()).collect();
    assert_eq!(types, vec!["interaction_detected", "stock_changed"]);

    // both events share the interaction boundaries
    assert_eq!(events[0].1, ts(4));
    assert_eq!(events[0].2, ts(8));
    assert_eq!(events[1].1, ts(4));

    // the decision trace records the threshold crossing
    let details: String = sqlx::query(
        "SELECT details FROM events WHERE device_id = 'cam-2' AND event_type = 'stock_changed'",
    )
    .fetch_one(&h.pool)
    .await
    .unwrap()
    .get("details");
    let parsed: serde_json::Value = serde_json::from_str(&details).unwrap();
    assert_eq!(parsed["schema_version"], 1);
    let trace: Vec<String> = parsed["trace"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert!(trace.contains(&"interaction_start".to_string()));
    assert!(trace.contains(&"delta_exceeded_threshold".to_string()));
    assert!(trace.contains(&"event_emitted".to_string()));
    assert!(parsed["scores"]["inventory_delta"].as_f64().unwrap() > 0.25);
    assert!(parsed["baseline_age_s"].is_number());
}

#[tokio::test]
async fn small_inventory_delta_stays_single_event() {
    let h = harness().await;
    configure_device(&h, "cam-3").await;

    // same shelf before and after the interaction: no stock change
    let frames = [
        flat(0),
        flat(0),
        flat(0),
        flat(0),
        split(255, 0),
        split(0, 255),
        flat(0),
        flat(0),
        flat(0),
    ];
    for (i, img) in frames.iter().enumerate() {
        send_frame(&h, "cam-3", i as i64, img, ts(i as i64)).await;
    }
    drain(&h).await;

    let events = events_of(&h, "cam-3").await;
    let types: Vec<&str> = events.iter().map(|(t, _, _)| t.as_str()).collect();
    assert_eq!(types, vec!["interaction_detected"]);
}

#[tokio::test]
async fn duplicate_seq_leaves_one_capture_and_one_job() {
    let h = harness().await;
    configure_device(&h, "cam-4").await;

    send_frame(&h, "cam-4", 1, &flat(0), ts(0)).await;
    let err = h
        .ingest
        .ingest_frame(
            FramePayload {
                device_id: "cam-4".to_string(),
                capture_ts: None,
                seq: 1,
                width: 32,
                height: 32,
                jpeg_quality: None,
                image_b64: Some(encode(&flat(0))),
            },
            ts(1),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, pivision::Error::Conflict(_)));

    let captures: i64 = sqlx::query("SELECT COUNT(*) AS cnt FROM captures WHERE device_id = 'cam-4'")
        .fetch_one(&h.pool)
        .await
        .unwrap()
        .get("cnt");
    assert_eq!(captures, 1);
    let jobs: i64 = sqlx::query("SELECT COUNT(*) AS cnt FROM jobs")
        .fetch_one(&h.pool)
        .await
        .unwrap()
        .get("cnt");
    assert_eq!(jobs, 1);
}

#[tokio::test]
async fn unconfigured_device_frames_are_skipped() {
    let h = harness().await;
    // no ROIs configured for this device
    send_frame(&h, "cam-5", 1, &flat(0), ts(0)).await;
    drain(&h).await;

    let status: String = sqlx::query("SELECT analysis_status FROM captures WHERE device_id = 'cam-5'")
        .fetch_one(&h.pool)
        .await
        .unwrap()
        .get("analysis_status");
    assert_eq!(status, "skipped");
    assert!(events_of(&h, "cam-5").await.is_empty());
}

#[tokio::test]
async fn rerunning_completed_decision_does_not_duplicate_events() {
    let h = harness().await;
    configure_device(&h, "cam-6").await;

    let frames = [flat(0), split(255, 0), flat(0), flat(0), flat(0)];
    for (i, img) in frames.iter().enumerate() {
        send_frame(&h, "cam-6", i as i64, img, ts(i as i64)).await;
    }
    drain(&h).await;
    assert_eq!(events_of(&h, "cam-6").await.len(), 1);

    // simulate a crash-recovery replay of the completing frame's job: the
    // uniqueness guard must absorb the duplicate decision
    sqlx::query(
        "UPDATE jobs SET status = 'queued', retry_at = NULL WHERE capture_id = (SELECT id FROM captures WHERE device_id = 'cam-6' AND seq = 4)",
    )
    .execute(&h.pool)
    .await
    .unwrap();
    drain(&h).await;

    assert_eq!(events_of(&h, "cam-6").await.len(), 1);
}
