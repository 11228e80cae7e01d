//! AnalysisWorker - Queue-Driven Frame Analysis Loop
//!
//! ## Responsibilities
//!
//! - Claim queued jobs and run the full per-frame pipeline: config
//!   hot-read, image load/decode, motion diff, interaction step, baseline
//!   feed, event emission
//! - Transition capture/job statuses per outcome
//! - Discard staging files the pipeline no longer holds as evidence
//!
//! Multiple workers can run concurrently: the queue's claim is exclusive
//! and serializes per device, so per-device state in the tracker, frame
//! cache and baseline manager is only touched by one worker at a time. A
//! crash at any point leaves at worst a stale `running` job, which the
//! reclaimer returns to the queue.

use crate::baseline_manager::BaselineManager;
use crate::config_store::ConfigStore;
use crate::delta_metrics::{inventory_delta_score, motion_score, NormRect};
use crate::error::{Error, Result};
use crate::event_emitter::EventEmitter;
use crate::frame_cache::{CachedFrame, FrameCache};
use crate::interaction_tracker::{FrameObservation, InteractionTracker, StepOutcome};
use crate::job_queue::{ClaimedJob, JobQueue};
use crate::models::{AnalysisStatus, Capture, DeviceConfig, Roi, RoiKind};
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::RwLock;

/// Worker tuning
#[derive(Debug, Clone)]
pub struct AnalysisWorkerConfig {
    /// Sleep between claim attempts when the queue is empty
    pub idle_poll_s: u64,
    /// Stable-frame delta vs baseline that counts as scene divergence
    pub scene_shift_threshold: f32,
    /// Consecutive divergent stable frames before scene_shifted fires
    pub scene_shift_frames: u32,
}

impl Default for AnalysisWorkerConfig {
    fn default() -> Self {
        Self {
            idle_poll_s: 2,
            scene_shift_threshold: 0.5,
            scene_shift_frames: 10,
        }
    }
}

/// One analysis worker instance
pub struct AnalysisWorker {
    worker_id: String,
    pool: SqlitePool,
    queue: JobQueue,
    config_store: ConfigStore,
    frame_cache: Arc<FrameCache>,
    baseline: Arc<BaselineManager>,
    tracker: Arc<InteractionTracker>,
    emitter: Arc<EventEmitter>,
    config: AnalysisWorkerConfig,
    /// Consecutive divergent stable frames per device
    scene_shift_counts: RwLock<HashMap<String, u32>>,
    running: Arc<RwLock<bool>>,
}

impl AnalysisWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: String,
        pool: SqlitePool,
        queue: JobQueue,
        config_store: ConfigStore,
        frame_cache: Arc<FrameCache>,
        baseline: Arc<BaselineManager>,
        tracker: Arc<InteractionTracker>,
        emitter: Arc<EventEmitter>,
        config: AnalysisWorkerConfig,
    ) -> Self {
        Self {
            worker_id,
            pool,
            queue,
            config_store,
            frame_cache,
            baseline,
            tracker,
            emitter,
            config,
            scene_shift_counts: RwLock::new(HashMap::new()),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the claim loop as a background task
    pub async fn start(self: Arc<Self>) {
        {
            let mut running = self.running.write().await;
            if *running {
                tracing::warn!(worker_id = %self.worker_id, "Worker already running");
                return;
            }
            *running = true;
        }

        tracing::info!(worker_id = %self.worker_id, "Analysis worker started");
        let worker = self.clone();
        tokio::spawn(async move {
            loop {
                {
                    let running = worker.running.read().await;
                    if !*running {
                        break;
                    }
                }

                match worker.tick().await {
                    Ok(true) => {} // processed a job, claim again immediately
                    Ok(false) => {
                        tokio::time::sleep(Duration::from_secs(worker.config.idle_poll_s)).await;
                    }
                    Err(e) => {
                        tracing::error!(worker_id = %worker.worker_id, error = %e, "Worker tick failed");
                        tokio::time::sleep(Duration::from_secs(worker.config.idle_poll_s)).await;
                    }
                }
            }
            tracing::info!(worker_id = %self.worker_id, "Analysis worker stopped");
        });
    }

    /// Stop the claim loop
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }

    /// Claim and process at most one job. Returns whether a job was claimed.
    pub async fn tick(&self) -> Result<bool> {
        let now = Utc::now();
        let Some(job) = self.queue.claim(&self.worker_id, now).await? else {
            return Ok(false);
        };

        match self.process_job(&job).await {
            Ok(()) => {
                self.queue.complete(job.id, Utc::now()).await?;
                tracing::debug!(
                    worker_id = %self.worker_id,
                    job_id = job.id,
                    capture_id = job.capture_id,
                    "Job done"
                );
            }
            Err(e) => {
                let status = self.queue.fail(job.id, job.attempts, &e, Utc::now()).await?;
                // the capture mirrors the job outcome: back to queued for a
                // retry, failed once the job dead-letters
                let capture_status = if status == crate::models::JobStatus::Dead {
                    AnalysisStatus::Failed
                } else {
                    AnalysisStatus::Queued
                };
                self.set_capture_status(job.capture_id, capture_status).await?;
            }
        }
        Ok(true)
    }

    /// Run the analysis pipeline for one claimed job
    async fn process_job(&self, job: &ClaimedJob) -> Result<()> {
        let capture = self.get_capture(job.capture_id).await?;
        let device_id = capture.device_id.clone();
        self.set_capture_status(capture.id, AnalysisStatus::Processing)
            .await?;

        // hot-read: config changes apply to this very frame
        let cfg = self.config_store.get_device_config(&device_id).await?;
        let rois = self.config_store.get_active_rois(&device_id).await?;

        let interaction_roi = rois.iter().find(|r| r.kind() == RoiKind::Interaction);
        let inventory_roi = rois.iter().find(|r| r.kind() == RoiKind::Inventory);
        let ignore: Vec<NormRect> = rois
            .iter()
            .filter(|r| r.kind() == RoiKind::Ignore)
            .map(NormRect::from)
            .collect();

        // a device with no interaction ROI configured is not analyzable yet
        let Some(interaction_roi) = interaction_roi else {
            tracing::info!(
                device_id = %device_id,
                capture_id = capture.id,
                "No interaction ROI configured, skipping frame"
            );
            self.set_capture_status(capture.id, AnalysisStatus::Skipped)
                .await?;
            self.discard_if_unreferenced(capture.id).await?;
            return Ok(());
        };

        let Some(uri) = capture.storage_uri.clone() else {
            // metadata-only frame
            self.set_capture_status(capture.id, AnalysisStatus::Skipped)
                .await?;
            self.discard_if_unreferenced(capture.id).await?;
            return Ok(());
        };

        let bytes = fs::read(&uri).await?;
        let img = image::load_from_memory(&bytes)?.to_luma8();

        let prev = self.frame_cache.get(&device_id, capture.received_ts).await;
        let motion = match &prev {
            // a resolution change makes the previous frame incomparable;
            // treat it like a cold start rather than failing the job
            Some(prev_frame) if prev_frame.image.dimensions() == img.dimensions() => {
                Some(motion_score(
                    &prev_frame.image,
                    &img,
                    &NormRect::from(interaction_roi),
                    &ignore,
                )?)
            }
            Some(_) | None => {
                tracing::debug!(
                    device_id = %device_id,
                    capture_id = capture.id,
                    "No previous frame, motion diff skipped"
                );
                None
            }
        };

        let obs = FrameObservation {
            capture_id: capture.id,
            received_ts: capture.received_ts,
            motion_score: motion,
        };
        let step = self.tracker.step(&device_id, &cfg, &obs).await;

        if step.is_stable {
            if let Some(inv) = inventory_roi {
                self.baseline
                    .observe(
                        &device_id,
                        &inv.name,
                        &img,
                        true,
                        cfg.baseline_update_rate,
                        capture.received_ts,
                    )
                    .await?;
                self.check_scene_shift(&device_id, &cfg, inv, &capture, &img)
                    .await?;
            }
        }

        match &step.outcome {
            StepOutcome::None => {}
            StepOutcome::Completed(interaction) => {
                let baseline_age = match inventory_roi {
                    Some(inv) => {
                        self.baseline
                            .age_secs(&device_id, &inv.name, capture.received_ts)
                            .await
                    }
                    None => None,
                };
                self.emitter
                    .emit_for_interaction(
                        &device_id,
                        &cfg,
                        interaction,
                        inventory_roi,
                        baseline_age,
                        Utc::now(),
                    )
                    .await?;
            }
            StepOutcome::Obstructed(report) => {
                self.emitter
                    .emit_obstruction(&device_id, &cfg, report, Utc::now())
                    .await?;
            }
        }

        self.frame_cache
            .store(
                &device_id,
                CachedFrame {
                    capture_id: capture.id,
                    received_ts: capture.received_ts,
                    image: Arc::new(img),
                },
            )
            .await;

        self.set_capture_status(capture.id, AnalysisStatus::Processed)
            .await?;

        // reclaim storage for frames the state machine no longer holds
        for released in &step.released {
            self.discard_if_unreferenced(*released).await?;
        }
        if !step.held {
            self.discard_if_unreferenced(capture.id).await?;
        }
        Ok(())
    }

    /// Scene-shift heuristic: a stable scene persistently far from the
    /// baseline means the camera moved or the shelf was rearranged.
    async fn check_scene_shift(
        &self,
        device_id: &str,
        cfg: &DeviceConfig,
        inventory_roi: &Roi,
        capture: &Capture,
        img: &image::GrayImage,
    ) -> Result<()> {
        let Some(baseline_img) = self.baseline.current(device_id, &inventory_roi.name).await
        else {
            return Ok(());
        };
        if baseline_img.dimensions() != img.dimensions() {
            return Ok(());
        }

        let score = inventory_delta_score(&baseline_img, img, &NormRect::from(inventory_roi))?;
        let fire = {
            let mut counts = self.scene_shift_counts.write().await;
            let count = counts.entry(device_id.to_string()).or_insert(0);
            if score > self.config.scene_shift_threshold {
                *count += 1;
                if *count >= self.config.scene_shift_frames {
                    *count = 0;
                    true
                } else {
                    false
                }
            } else {
                *count = 0;
                false
            }
        };

        if fire {
            let age = self
                .baseline
                .age_secs(device_id, &inventory_roi.name, capture.received_ts)
                .await;
            self.emitter
                .emit_scene_shift(
                    device_id,
                    cfg,
                    capture.id,
                    score,
                    age,
                    capture.received_ts,
                    Utc::now(),
                )
                .await?;
            // start over from the new scene so the alarm fires once
            self.baseline
                .reset(device_id, &inventory_roi.name, img, capture.received_ts)
                .await?;
        }
        Ok(())
    }

    /// Discard a staging capture no event references: remove the file,
    /// mark the row `discarded` (terminal).
    async fn discard_if_unreferenced(&self, capture_id: i64) -> Result<()> {
        let row = sqlx::query(
            r#"
            SELECT storage_uri FROM captures
            WHERE id = ? AND storage_class = 'staging'
              AND NOT EXISTS (SELECT 1 FROM event_images ei WHERE ei.capture_id = captures.id)
            "#,
        )
        .bind(capture_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(());
        };

        if let Some(uri) = row.get::<Option<String>, _>("storage_uri") {
            if let Err(e) = fs::remove_file(&uri).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }

        sqlx::query("UPDATE captures SET storage_class = 'discarded' WHERE id = ? AND storage_class = 'staging'")
            .bind(capture_id)
            .execute(&self.pool)
            .await?;
        tracing::trace!(capture_id = capture_id, "Staging capture discarded");
        Ok(())
    }

    async fn get_capture(&self, capture_id: i64) -> Result<Capture> {
        sqlx::query_as::<_, Capture>(
            r#"
            SELECT id, device_id, seq, capture_ts, received_ts, width, height,
                   jpeg_quality, storage_uri, storage_class, analysis_status
            FROM captures WHERE id = ?
            "#,
        )
        .bind(capture_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("capture {}", capture_id)))
    }

    async fn set_capture_status(&self, capture_id: i64, status: AnalysisStatus) -> Result<()> {
        sqlx::query("UPDATE captures SET analysis_status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(capture_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
