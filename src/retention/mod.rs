//! RetentionJob - Scheduled Storage Reclamation
//!
//! ## Responsibilities
//!
//! - Delete evidence image files for events that ended more than
//!   `retention_days` ago (event rows are kept forever)
//! - Discard staging files older than a short ceiling regardless of
//!   analysis status (orphans from crashed workers)
//! - Purge long-done jobs
//!
//! Runs on a fixed schedule, independent of pipeline activity. Ages come
//! from database timestamps, never file mtime, so the sweep cannot race an
//! event image that is still being written (EventImage rows are only
//! published after the file write). Idempotent: a second sweep over
//! unchanged data removes nothing and reports no errors; a missing file is
//! success, not failure. Per-item errors are logged and skipped so one bad
//! path never aborts the sweep.

use crate::error::Result;
use crate::job_queue::JobQueue;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;

/// Retention policy
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Days to keep event evidence images
    pub retention_days: i64,
    /// Hours to keep staging files, regardless of analysis status
    pub staging_max_age_hours: i64,
    /// Seconds between scheduled sweeps
    pub tick_interval_s: u64,
    /// Root of promoted evidence images, for empty-folder cleanup
    pub events_dir: PathBuf,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: 7,
            staging_max_age_hours: 24,
            tick_interval_s: 3600,
            events_dir: PathBuf::from("data/events"),
        }
    }
}

/// One sweep's outcome
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Evidence image files actually removed
    pub event_files_removed: u64,
    /// Staging captures discarded
    pub staging_discarded: u64,
    /// Done jobs purged
    pub jobs_purged: u64,
    /// Items that errored and were skipped
    pub errors: u64,
}

/// Periodic storage reclamation job
pub struct RetentionJob {
    pool: SqlitePool,
    queue: JobQueue,
    config: RetentionConfig,
    running: Arc<RwLock<bool>>,
}

impl RetentionJob {
    pub fn new(pool: SqlitePool, queue: JobQueue, config: RetentionConfig) -> Self {
        Self {
            pool,
            queue,
            config,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the scheduled sweep loop
    pub async fn start(self: Arc<Self>) {
        {
            let mut running = self.running.write().await;
            if *running {
                tracing::warn!("Retention job already running");
                return;
            }
            *running = true;
        }

        tracing::info!(
            retention_days = self.config.retention_days,
            staging_max_age_hours = self.config.staging_max_age_hours,
            "Retention job started"
        );

        let job = self.clone();
        tokio::spawn(async move {
            loop {
                {
                    let running = job.running.read().await;
                    if !*running {
                        break;
                    }
                }
                match job.sweep(Utc::now()).await {
                    Ok(stats) => tracing::info!(
                        event_files_removed = stats.event_files_removed,
                        staging_discarded = stats.staging_discarded,
                        jobs_purged = stats.jobs_purged,
                        errors = stats.errors,
                        "Retention sweep completed"
                    ),
                    Err(e) => tracing::error!(error = %e, "Retention sweep failed"),
                }
                tokio::time::sleep(std::time::Duration::from_secs(job.config.tick_interval_s))
                    .await;
            }
            tracing::info!("Retention job stopped");
        });
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }

    /// Run one full sweep
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        self.sweep_event_images(now, &mut stats).await?;
        self.sweep_staging(now, &mut stats).await?;
        stats.jobs_purged = self
            .queue
            .purge_done(now - Duration::days(self.config.retention_days))
            .await?;
        self.prune_empty_event_dirs().await;
        Ok(stats)
    }

    /// Remove evidence files of events that ended past retention. Event and
    /// EventImage rows stay; only the bytes on disk are reclaimed.
    async fn sweep_event_images(&self, now: DateTime<Utc>, stats: &mut SweepStats) -> Result<()> {
        let cutoff = now - Duration::days(self.config.retention_days);
        let rows = sqlx::query(
            r#"
            SELECT ei.path FROM event_images ei
            JOIN events e ON e.id = ei.event_id
            WHERE COALESCE(e.ended_at, e.created_at) < ?
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let path: String = row.get("path");
            match fs::remove_file(&path).await {
                Ok(()) => stats.event_files_removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // already reclaimed by a previous sweep
                }
                Err(e) => {
                    stats.errors += 1;
                    tracing::warn!(path = %path, error = %e, "Failed to remove event image");
                }
            }
        }
        Ok(())
    }

    /// Discard staging captures past the ceiling, whatever their analysis
    /// status: crashed workers must not leak files forever.
    async fn sweep_staging(&self, now: DateTime<Utc>, stats: &mut SweepStats) -> Result<()> {
        let cutoff = now - Duration::hours(self.config.staging_max_age_hours);
        let rows = sqlx::query(
            "SELECT id, storage_uri FROM captures WHERE storage_class = 'staging' AND received_ts < ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let capture_id: i64 = row.get("id");
            if let Some(uri) = row.get::<Option<String>, _>("storage_uri") {
                match fs::remove_file(&uri).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        stats.errors += 1;
                        tracing::warn!(
                            capture_id = capture_id,
                            path = %uri,
                            error = %e,
                            "Failed to remove staging file"
                        );
                        continue;
                    }
                }
            }
            sqlx::query(
                "UPDATE captures SET storage_class = 'discarded' WHERE id = ? AND storage_class = 'staging'",
            )
            .bind(capture_id)
            .execute(&self.pool)
            .await?;
            stats.staging_discarded += 1;
        }
        Ok(())
    }

    /// Remove empty device/date folders left behind under the events root
    async fn prune_empty_event_dirs(&self) {
        let Ok(mut devices) = fs::read_dir(&self.config.events_dir).await else {
            return;
        };
        while let Ok(Some(device_dir)) = devices.next_entry().await {
            let Ok(mut dates) = fs::read_dir(device_dir.path()).await else {
                continue;
            };
            while let Ok(Some(date_dir)) = dates.next_entry().await {
                // rmdir fails on non-empty directories, which is the point
                let _ = fs::remove_dir(date_dir.path()).await;
            }
            let _ = fs::remove_dir(device_dir.path()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;

    async fn insert_capture(
        pool: &SqlitePool,
        device_id: &str,
        seq: i64,
        received_ts: DateTime<Utc>,
        uri: Option<&str>,
        class: &str,
    ) -> i64 {
        sqlx::query(
            r#"
            INSERT INTO captures (device_id, seq, received_ts, width, height, storage_uri, storage_class)
            VALUES (?, ?, ?, 640, 480, ?, ?)
            RETURNING id
            "#,
        )
        .bind(device_id)
        .bind(seq)
        .bind(received_ts)
        .bind(uri)
        .bind(class)
        .fetch_one(pool)
        .await
        .unwrap()
        .get("id")
    }

    async fn insert_event_with_image(
        pool: &SqlitePool,
        device_id: &str,
        ended_at: DateTime<Utc>,
        capture_id: i64,
        path: &str,
    ) -> i64 {
        let event_id: i64 = sqlx::query(
            r#"
            INSERT INTO events (device_id, event_type, started_at, ended_at, confidence, details, created_at)
            VALUES (?, 'interaction_detected', ?, ?, 0.5, '{}', ?)
            RETURNING id
            "#,
        )
        .bind(device_id)
        .bind(ended_at)
        .bind(ended_at)
        .bind(ended_at)
        .fetch_one(pool)
        .await
        .unwrap()
        .get("id");

        sqlx::query(
            "INSERT INTO event_images (event_id, capture_id, role, path, created_at) VALUES (?, ?, 'post', ?, ?)",
        )
        .bind(event_id)
        .bind(capture_id)
        .bind(path)
        .bind(ended_at)
        .execute(pool)
        .await
        .unwrap();
        event_id
    }

    fn job(pool: SqlitePool, events_dir: PathBuf) -> RetentionJob {
        RetentionJob::new(
            pool.clone(),
            JobQueue::with_defaults(pool),
            RetentionConfig {
                retention_days: 7,
                staging_max_age_hours: 24,
                tick_interval_s: 3600,
                events_dir,
            },
        )
    }

    #[tokio::test]
    async fn test_expired_event_files_removed_rows_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = test_pool().await;
        let now = Utc::now();

        let old = now - Duration::days(8);
        let file = tmp.path().join("cam-1").join("2026-01-01");
        fs::create_dir_all(&file).await.unwrap();
        let file = file.join("1_post.jpg");
        fs::write(&file, b"jpeg").await.unwrap();

        let capture = insert_capture(&pool, "cam-1", 1, old, None, "event").await;
        insert_event_with_image(&pool, "cam-1", old, capture, &file.to_string_lossy()).await;

        let retention = job(pool.clone(), tmp.path().to_path_buf());
        let stats = retention.sweep(now).await.unwrap();
        assert_eq!(stats.event_files_removed, 1);
        assert_eq!(stats.errors, 0);
        assert!(!file.exists());

        // the event row outlives its images
        let events: i64 = sqlx::query("SELECT COUNT(*) AS cnt FROM events")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get("cnt");
        assert_eq!(events, 1);
    }

    #[tokio::test]
    async fn test_recent_event_files_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = test_pool().await;
        let now = Utc::now();

        let recent = now - Duration::days(2);
        let file = tmp.path().join("fresh.jpg");
        fs::write(&file, b"jpeg").await.unwrap();
        let capture = insert_capture(&pool, "cam-1", 1, recent, None, "event").await;
        insert_event_with_image(&pool, "cam-1", recent, capture, &file.to_string_lossy()).await;

        let retention = job(pool, tmp.path().to_path_buf());
        let stats = retention.sweep(now).await.unwrap();
        assert_eq!(stats.event_files_removed, 0);
        assert!(file.exists());
    }

    #[tokio::test]
    async fn test_staging_ceiling_ignores_analysis_status() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = test_pool().await;
        let now = Utc::now();

        let orphan = tmp.path().join("cam-1-1.jpg");
        fs::write(&orphan, b"jpeg").await.unwrap();
        // still 'queued': its worker crashed long ago
        let old_id = insert_capture(
            &pool,
            "cam-1",
            1,
            now - Duration::hours(25),
            Some(&orphan.to_string_lossy()),
            "staging",
        )
        .await;
        let fresh = tmp.path().join("cam-1-2.jpg");
        fs::write(&fresh, b"jpeg").await.unwrap();
        insert_capture(
            &pool,
            "cam-1",
            2,
            now - Duration::hours(1),
            Some(&fresh.to_string_lossy()),
            "staging",
        )
        .await;

        let retention = job(pool.clone(), tmp.path().to_path_buf());
        let stats = retention.sweep(now).await.unwrap();
        assert_eq!(stats.staging_discarded, 1);
        assert!(!orphan.exists());
        assert!(fresh.exists());

        let class: String = sqlx::query("SELECT storage_class FROM captures WHERE id = ?")
            .bind(old_id)
            .fetch_one(&pool)
            .await
            .unwrap()
            .get("storage_class");
        assert_eq!(class, "discarded");
    }

    #[tokio::test]
    async fn test_sweep_twice_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = test_pool().await;
        let now = Utc::now();
        let old = now - Duration::days(8);

        let file = tmp.path().join("old.jpg");
        fs::write(&file, b"jpeg").await.unwrap();
        let capture = insert_capture(&pool, "cam-1", 1, old, None, "event").await;
        insert_event_with_image(&pool, "cam-1", old, capture, &file.to_string_lossy()).await;
        let staging = tmp.path().join("stale.jpg");
        fs::write(&staging, b"jpeg").await.unwrap();
        insert_capture(
            &pool,
            "cam-1",
            2,
            now - Duration::hours(30),
            Some(&staging.to_string_lossy()),
            "staging",
        )
        .await;

        let retention = job(pool, tmp.path().to_path_buf());
        let first = retention.sweep(now).await.unwrap();
        assert_eq!(first.event_files_removed, 1);
        assert_eq!(first.staging_discarded, 1);

        let second = retention.sweep(now).await.unwrap();
        assert_eq!(second, SweepStats::default());
    }

    #[tokio::test]
    async fn test_missing_file_is_success() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = test_pool().await;
        let now = Utc::now();
        let old = now - Duration::days(8);

        let capture = insert_capture(&pool, "cam-1", 1, old, None, "event").await;
        insert_event_with_image(&pool, "cam-1", old, capture, "/nonexistent/gone.jpg").await;
        insert_capture(
            &pool,
            "cam-1",
            2,
            now - Duration::hours(30),
            Some("/nonexistent/also-gone.jpg"),
            "staging",
        )
        .await;

        let retention = job(pool, tmp.path().to_path_buf());
        let stats = retention.sweep(now).await.unwrap();
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.event_files_removed, 0);
        // the row is still discarded even though its file was already gone
        assert_eq!(stats.staging_discarded, 1);
    }
}
