//! MetricsService - Read-Only Observability Queries
//!
//! What the dashboard collaborator reads: event history with resolved
//! evidence, queue depth, and ingest health. No write path into the
//! pipeline's state.

use crate::error::Result;
use crate::models::{Event, EventImage, Job};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

/// Ingest health over a time window
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStats {
    pub success_total: i64,
    pub failure_total: i64,
    pub success_window: i64,
    pub failure_window: i64,
    pub avg_latency_ms: f64,
}

/// An event with its resolved evidence links
#[derive(Debug, Clone, Serialize)]
pub struct EventWithImages {
    pub event: Event,
    pub images: Vec<EventImage>,
}

/// Read-only stats service over the shared pool
#[derive(Clone)]
pub struct MetricsService {
    pool: SqlitePool,
}

impl MetricsService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Ingest outcomes, totals plus a recent window
    pub async fn ingest_stats(
        &self,
        now: DateTime<Utc>,
        window_minutes: i64,
    ) -> Result<IngestStats> {
        let window_start = now - Duration::minutes(window_minutes);
        let row = sqlx::query(
            r#"
            SELECT
                SUM(CASE WHEN ok THEN 1 ELSE 0 END) AS success_total,
                SUM(CASE WHEN ok THEN 0 ELSE 1 END) AS failure_total,
                SUM(CASE WHEN ok AND request_ts >= ? THEN 1 ELSE 0 END) AS success_window,
                SUM(CASE WHEN NOT ok AND request_ts >= ? THEN 1 ELSE 0 END) AS failure_window,
                AVG(CASE WHEN request_ts >= ? THEN latency_ms END) AS avg_latency_ms
            FROM ingest_audit
            "#,
        )
        .bind(window_start)
        .bind(window_start)
        .bind(window_start)
        .fetch_one(&self.pool)
        .await?;

        Ok(IngestStats {
            success_total: row.get::<Option<i64>, _>("success_total").unwrap_or(0),
            failure_total: row.get::<Option<i64>, _>("failure_total").unwrap_or(0),
            success_window: row.get::<Option<i64>, _>("success_window").unwrap_or(0),
            failure_window: row.get::<Option<i64>, _>("failure_window").unwrap_or(0),
            avg_latency_ms: row.get::<Option<f64>, _>("avg_latency_ms").unwrap_or(0.0),
        })
    }

    /// Most recent events, newest first, with their evidence links
    pub async fn recent_events(&self, limit: i64) -> Result<Vec<EventWithImages>> {
        let events = sqlx::query_as::<_, Event>(
            r#"
            SELECT id, device_id, event_type, started_at, ended_at, confidence, details, created_at
            FROM events ORDER BY started_at DESC, id DESC LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(events.len());
        for event in events {
            let images = sqlx::query_as::<_, EventImage>(
                "SELECT id, event_id, capture_id, role, path, created_at FROM event_images WHERE event_id = ? ORDER BY role",
            )
            .bind(event.id)
            .fetch_all(&self.pool)
            .await?;
            out.push(EventWithImages { event, images });
        }
        Ok(out)
    }

    /// Dead jobs awaiting operator intervention, oldest first
    pub async fn dead_jobs(&self, limit: i64) -> Result<Vec<Job>> {
        Ok(sqlx::query_as::<_, Job>(
            r#"
            SELECT id, capture_id, status, attempts, last_error, retry_at, claimed_by,
                   created_ts, updated_ts
            FROM jobs WHERE status = 'dead' ORDER BY id LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Per-analysis-status capture counts
    pub async fn capture_status_counts(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT analysis_status, COUNT(*) AS cnt FROM captures GROUP BY analysis_status ORDER BY analysis_status",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get("analysis_status"), r.get("cnt")))
            .collect())
    }
}
