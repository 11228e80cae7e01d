//! IngestService - Frame Intake Contract
//!
//! ## Responsibilities
//!
//! - Accept one frame: validate, decode, write the staging JPEG, record
//!   the capture, enqueue analysis work
//! - Reject duplicate (device, seq) uploads so a retried upload leaves
//!   exactly one capture row
//! - Track device heartbeats and ingest audit entries
//!
//! The HTTP transport layer is an external collaborator; it calls these
//! functions and owns status codes, auth, and payload framing.

use crate::config_store::ConfigStore;
use crate::error::{Error, Result};
use crate::job_queue::JobQueue;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;
use std::time::Instant;
use tokio::fs;

/// One incoming frame, as handed over by the transport layer
#[derive(Debug, Clone, Deserialize)]
pub struct FramePayload {
    pub device_id: String,
    pub capture_ts: Option<String>,
    pub seq: i64,
    pub width: i32,
    pub height: i32,
    pub jpeg_quality: Option<i32>,
    /// Base64-encoded JPEG; a frame without image data is metadata-only
    pub image_b64: Option<String>,
}

/// Accepted-frame receipt
#[derive(Debug, Clone, Serialize)]
pub struct IngestAccepted {
    pub capture_id: i64,
    pub received_ts: DateTime<Utc>,
}

/// Frame intake service
#[derive(Clone)]
pub struct IngestService {
    pool: SqlitePool,
    config_store: ConfigStore,
    queue: JobQueue,
    staging_dir: PathBuf,
    device_key: String,
}

impl IngestService {
    pub fn new(
        pool: SqlitePool,
        config_store: ConfigStore,
        queue: JobQueue,
        staging_dir: PathBuf,
        device_key: String,
    ) -> Self {
        Self {
            pool,
            config_store,
            queue,
            staging_dir,
            device_key,
        }
    }

    /// Ingest one frame: staging file first, then capture row, then job.
    pub async fn ingest_frame(
        &self,
        payload: FramePayload,
        now: DateTime<Utc>,
    ) -> Result<IngestAccepted> {
        let started = Instant::now();
        let result = self.ingest_frame_inner(&payload, now).await;
        let latency_ms = started.elapsed().as_millis() as i64;
        if let Err(e) = self
            .record_audit("/api/v1/ingest/frame", result.is_ok(), latency_ms, now)
            .await
        {
            tracing::warn!(error = %e, "Failed to record ingest audit");
        }

        match &result {
            Ok(accepted) => tracing::info!(
                device_id = %payload.device_id,
                seq = payload.seq,
                capture_id = accepted.capture_id,
                latency_ms = latency_ms,
                "Frame ingested"
            ),
            Err(e) => tracing::warn!(
                device_id = %payload.device_id,
                seq = payload.seq,
                error = %e,
                "Frame rejected"
            ),
        }
        result
    }

    async fn ingest_frame_inner(
        &self,
        payload: &FramePayload,
        now: DateTime<Utc>,
    ) -> Result<IngestAccepted> {
        if payload.device_id.is_empty() {
            return Err(Error::Validation("device_id must not be empty".into()));
        }
        if payload.width <= 0 || payload.height <= 0 {
            return Err(Error::Validation("width/height must be positive".into()));
        }

        let image_bytes = match &payload.image_b64 {
            Some(b64) => Some(
                base64::engine::general_purpose::STANDARD
                    .decode(b64)
                    .map_err(|_| Error::Validation("invalid image_b64".into()))?,
            ),
            None => None,
        };

        let storage_uri = match image_bytes {
            Some(bytes) => {
                fs::create_dir_all(&self.staging_dir).await?;
                let path = self
                    .staging_dir
                    .join(format!("{}-{}.jpg", payload.device_id, payload.seq));
                fs::write(&path, &bytes).await?;
                Some(path.to_string_lossy().to_string())
            }
            None => None,
        };

        self.config_store
            .touch_device(&payload.device_id, &self.device_key, now)
            .await?;

        let insert = sqlx::query(
            r#"
            INSERT INTO captures
                (device_id, seq, capture_ts, received_ts, width, height, jpeg_quality,
                 storage_uri, storage_class, analysis_status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'staging', 'queued')
            RETURNING id
            "#,
        )
        .bind(&payload.device_id)
        .bind(payload.seq)
        .bind(&payload.capture_ts)
        .bind(now)
        .bind(payload.width)
        .bind(payload.height)
        .bind(payload.jpeg_quality)
        .bind(&storage_uri)
        .fetch_one(&self.pool)
        .await;

        let capture_id: i64 = match insert {
            Ok(row) => row.get("id"),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(Error::Conflict(format!(
                    "duplicate device seq {}/{}",
                    payload.device_id, payload.seq
                )));
            }
            Err(e) => return Err(e.into()),
        };

        self.queue.enqueue(capture_id, now).await?;

        Ok(IngestAccepted {
            capture_id,
            received_ts: now,
        })
    }

    /// Record one ingest request outcome
    pub async fn record_audit(
        &self,
        endpoint: &str,
        ok: bool,
        latency_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO ingest_audit (request_ts, endpoint, ok, latency_ms) VALUES (?, ?, ?, ?)",
        )
        .bind(now)
        .bind(endpoint)
        .bind(ok)
        .bind(latency_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Heartbeat intake (device telemetry without a frame)
    pub async fn heartbeat(
        &self,
        device_id: &str,
        rssi: Option<i32>,
        battery_mv: Option<i32>,
        fw_version: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if device_id.is_empty() {
            return Err(Error::Validation("device_id must not be empty".into()));
        }
        self.config_store
            .record_heartbeat(device_id, &self.device_key, rssi, battery_mv, fw_version, now)
            .await
    }
}
