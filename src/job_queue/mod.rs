//! JobQueue - Durable Per-Capture Analysis Queue
//!
//! ## Responsibilities
//!
//! - Crash-safe FIFO of analysis work, persisted in the jobs table
//! - Atomic claim: one conditional UPDATE takes the oldest eligible job,
//!   so two workers can never hold the same job
//! - Per-device serialization: a device with a running job is skipped, so
//!   one device's frames are always processed in order
//! - Retry with capped exponential backoff and jitter; dead-letter after
//!   `max_attempts`
//! - Stale-running reclaim for crash recovery

use crate::error::{Error, Result};
use crate::models::JobStatus;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

/// Queue tuning
#[derive(Debug, Clone)]
pub struct JobQueueConfig {
    /// Attempts before a job dead-letters
    pub max_attempts: u32,
    /// First retry delay in seconds; doubles per attempt
    pub backoff_base_s: u64,
    /// Retry delay ceiling in seconds
    pub backoff_cap_s: u64,
    /// A running job untouched for this long is considered abandoned
    pub staleness_timeout_s: i64,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_s: 5,
            backoff_cap_s: 300,
            staleness_timeout_s: 120,
        }
    }
}

/// A job handed to a worker by `claim`
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: i64,
    pub capture_id: i64,
    pub attempts: i64,
}

/// Per-status queue counts
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueDepth {
    pub queued: i64,
    pub running: i64,
    pub done: i64,
    pub failed: i64,
    pub dead: i64,
}

impl QueueDepth {
    /// Outstanding work (everything that is not done)
    pub fn depth(&self) -> i64 {
        self.queued + self.running + self.failed + self.dead
    }
}

/// Durable analysis job queue
#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    config: JobQueueConfig,
}

impl JobQueue {
    pub fn new(pool: SqlitePool, config: JobQueueConfig) -> Self {
        Self { pool, config }
    }

    pub fn with_defaults(pool: SqlitePool) -> Self {
        Self::new(pool, JobQueueConfig::default())
    }

    /// Enqueue analysis work for a capture. A capture already queued keeps
    /// its existing job (one job per capture).
    pub async fn enqueue(&self, capture_id: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (capture_id, status, attempts, created_ts, updated_ts)
            VALUES (?, 'queued', 0, ?, ?)
            ON CONFLICT(capture_id) DO NOTHING
            "#,
        )
        .bind(capture_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically claim the oldest eligible job for this worker.
    ///
    /// Eligible: `queued`, or `failed` with its retry delay elapsed, with
    /// no older job of the same device still outstanding. Only the head
    /// of each device's line is ever claimable, so one device's frames are
    /// processed strictly in order even across retries, and a job waiting
    /// out its backoff blocks that device's newer frames (head-of-line by
    /// design; a dead head unblocks the line). The single conditional
    /// UPDATE is the concurrency control; there is no read-then-write
    /// window.
    pub async fn claim(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<ClaimedJob>> {
        let row = sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'running',
                attempts = attempts + 1,
                claimed_by = ?,
                updated_ts = ?
            WHERE id = (
                SELECT j.id FROM jobs j
                JOIN captures c ON c.id = j.capture_id
                WHERE (j.status = 'queued' OR (j.status = 'failed' AND j.retry_at <= ?))
                  AND (j.retry_at IS NULL OR j.retry_at <= ?)
                  AND NOT EXISTS (
                      SELECT 1 FROM jobs p
                      JOIN captures pc ON pc.id = p.capture_id
                      WHERE pc.device_id = c.device_id
                        AND p.id < j.id
                        AND p.status IN ('queued', 'running', 'failed')
                  )
                ORDER BY j.id
                LIMIT 1
            )
            RETURNING id, capture_id, attempts
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ClaimedJob {
            id: r.get("id"),
            capture_id: r.get("capture_id"),
            attempts: r.get("attempts"),
        }))
    }

    /// Mark a job done
    pub async fn complete(&self, job_id: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = 'done', updated_ts = ? WHERE id = ?")
            .bind(now)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a failure, deciding between retry and dead-letter.
    ///
    /// Permanent errors dead-letter immediately; transient errors retry
    /// with capped exponential backoff until `max_attempts`.
    pub async fn fail(
        &self,
        job_id: i64,
        attempts: i64,
        error: &Error,
        now: DateTime<Utc>,
    ) -> Result<JobStatus> {
        let retryable = error.is_transient() && (attempts as u32) < self.config.max_attempts;
        let status = if retryable {
            JobStatus::Failed
        } else {
            JobStatus::Dead
        };
        let retry_at = retryable.then(|| now + self.backoff(attempts as u32));

        sqlx::query(
            "UPDATE jobs SET status = ?, last_error = ?, retry_at = ?, updated_ts = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error.to_string())
        .bind(retry_at)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if status == JobStatus::Dead {
            tracing::error!(
                job_id = job_id,
                attempts = attempts,
                error = %error,
                "Job dead-lettered"
            );
        } else {
            tracing::warn!(
                job_id = job_id,
                attempts = attempts,
                retry_at = ?retry_at,
                error = %error,
                "Job failed, will retry"
            );
        }
        Ok(status)
    }

    /// Retry delay for the given attempt count: exponential, capped, with
    /// up to one base interval of jitter to spread hot retries.
    fn backoff(&self, attempts: u32) -> Duration {
        let exp = self
            .config
            .backoff_base_s
            .saturating_mul(1u64 << (attempts.saturating_sub(1)).min(16));
        let capped = exp.min(self.config.backoff_cap_s);
        let jitter_ms = rand::thread_rng().gen_range(0..=self.config.backoff_base_s * 1000);
        Duration::milliseconds((capped * 1000 + jitter_ms) as i64)
    }

    /// Return jobs stuck `running` past the staleness timeout to `queued`
    /// (crash recovery). Returns how many were reclaimed; a second sweep
    /// over unchanged data reclaims nothing.
    pub async fn reclaim_stale(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - Duration::seconds(self.config.staleness_timeout_s);
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = 'queued', claimed_by = NULL, updated_ts = ?
            WHERE status = 'running' AND updated_ts < ?
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            tracing::warn!(count = reclaimed, "Reclaimed stale running jobs");
        }
        Ok(reclaimed)
    }

    /// Delete `done` jobs older than the cutoff (retention only; the worker
    /// never destroys jobs and dead jobs stay visible to operators)
    pub async fn purge_done(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE status = 'done' AND updated_ts < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Per-status counts for observability
    pub async fn depth(&self) -> Result<QueueDepth> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS cnt FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut depth = QueueDepth::default();
        for row in rows {
            let status: String = row.get("status");
            let cnt: i64 = row.get("cnt");
            match JobStatus::from(status.as_str()) {
                JobStatus::Queued => depth.queued = cnt,
                JobStatus::Running => depth.running = cnt,
                JobStatus::Done => depth.done = cnt,
                JobStatus::Failed => depth.failed = cnt,
                JobStatus::Dead => depth.dead = cnt,
            }
        }
        Ok(depth)
    }

    /// Status of one job (diagnostics and tests)
    pub async fn job_status(&self, job_id: i64) -> Result<JobStatus> {
        let row = sqlx::query("SELECT status FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))?;
        let status: String = row.get("status");
        Ok(JobStatus::from(status.as_str()))
    }
}
