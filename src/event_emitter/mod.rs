//! EventEmitter - Durable Activity Events with Linked Evidence
//!
//! ## Responsibilities
//!
//! - Persist `interaction_detected` for every completed interaction
//! - Decide `stock_changed` from the pre/post inventory delta
//! - Persist `camera_obstructed` and `scene_shifted` heuristic events
//! - Promote evidence captures staging -> event (file copy first, link row
//!   after, storage-class transition last)
//! - Record a structured, versioned decision trace for auditability
//!
//! Re-running the same completed interaction is safe: the
//! (device, event_type, started_at) uniqueness turns duplicates into
//! no-ops, file copies overwrite identically, and the storage-class
//! transition only ever fires on `staging` rows. A job is therefore
//! repairable by retry after a crash between any two steps here.

use crate::delta_metrics::{inventory_delta_score, NormRect};
use crate::detector::Detector;
use crate::error::{Error, Result};
use crate::interaction_tracker::{CompletedInteraction, ObstructionReport};
use crate::models::{Capture, DeviceConfig, EventImageRole, EventType, Roi};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;
use tokio::fs;

/// Details payload schema version; bump when the structure changes
pub const DETAILS_SCHEMA_VERSION: u32 = 1;

/// One step of the decision trace, in decision order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStep {
    InteractionStart,
    PostStableFound,
    PostMissing,
    InventoryRoiMissing,
    BaselineAbsent,
    DeltaComputed,
    DeltaExceededThreshold,
    DeltaBelowThreshold,
    DetectorConsulted,
    ObstructionCeilingHit,
    SceneShiftDetected,
    EventEmitted,
}

/// Thresholds in effect when the decision was made
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdsInEffect {
    pub interaction_threshold: f32,
    pub interaction_min_frames: u32,
    pub interaction_end_timeout_s: f32,
    pub inventory_change_threshold: f32,
    pub config_version: i64,
}

impl ThresholdsInEffect {
    fn from_config(cfg: &DeviceConfig) -> Self {
        Self {
            interaction_threshold: cfg.interaction_threshold,
            interaction_min_frames: cfg.interaction_min_frames,
            interaction_end_timeout_s: cfg.interaction_end_timeout_s,
            inventory_change_threshold: cfg.inventory_change_threshold,
            config_version: cfg.config_version,
        }
    }
}

/// Raw scores behind the decision
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionScores {
    pub peak_motion: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inventory_delta: Option<f32>,
}

/// Evidence capture references
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureRefs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub during: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post: Option<i64>,
}

/// Structured, versioned `details` payload stored with every event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDetails {
    pub schema_version: u32,
    pub thresholds: ThresholdsInEffect,
    pub scores: DecisionScores,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_age_s: Option<i64>,
    pub captures: CaptureRefs,
    pub trace: Vec<TraceStep>,
}

/// An event row this emitter created (or found already present)
#[derive(Debug, Clone)]
pub struct EmittedEvent {
    pub event_id: i64,
    pub event_type: EventType,
}

/// EventEmitter configuration
#[derive(Debug, Clone)]
pub struct EventEmitterConfig {
    /// Root for promoted evidence images: `<events_dir>/<device>/<date>/`
    pub events_dir: PathBuf,
}

/// Activity event writer
pub struct EventEmitter {
    pool: SqlitePool,
    config: EventEmitterConfig,
    detector: Detector,
}

impl EventEmitter {
    pub fn new(pool: SqlitePool, config: EventEmitterConfig, detector: Detector) -> Self {
        Self {
            pool,
            config,
            detector,
        }
    }

    /// Emit events for one completed interaction.
    ///
    /// Always emits `interaction_detected`; additionally `stock_changed`
    /// when the pre/post inventory delta exceeds the device threshold, and
    /// `empty_confirmed` when the external detector (if configured) calls
    /// the post frame empty. Returns the events in emission order.
    pub async fn emit_for_interaction(
        &self,
        device_id: &str,
        cfg: &DeviceConfig,
        interaction: &CompletedInteraction,
        inventory_roi: Option<&Roi>,
        baseline_age_s: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<EmittedEvent>> {
        let mut trace = vec![TraceStep::InteractionStart];
        let mut emitted = Vec::new();

        let pre = self.load_evidence(interaction.pre_capture).await?;
        let during = self.load_evidence(interaction.during_capture).await?;
        let post = self.load_evidence(interaction.post_capture).await?;

        if post.is_some() {
            trace.push(TraceStep::PostStableFound);
        } else {
            trace.push(TraceStep::PostMissing);
        }

        // stock-change decision, shared by both events' traces
        let mut inventory_delta = None;
        let mut stock_changed = false;
        match (inventory_roi, &pre, &post) {
            (None, _, _) => {
                trace.push(TraceStep::InventoryRoiMissing);
            }
            (Some(_), _, _) if baseline_age_s.is_none() => {
                // cold start: no reference yet, informational skip
                trace.push(TraceStep::BaselineAbsent);
                tracing::info!(
                    device_id = %device_id,
                    "Baseline absent, skipping inventory-change check"
                );
            }
            (Some(roi), Some(pre_ev), Some(post_ev)) => {
                let score = inventory_delta_score(
                    &pre_ev.image,
                    &post_ev.image,
                    &NormRect::from(roi),
                )?;
                inventory_delta = Some(score);
                trace.push(TraceStep::DeltaComputed);
                if score > cfg.inventory_change_threshold {
                    trace.push(TraceStep::DeltaExceededThreshold);
                    stock_changed = true;
                } else {
                    trace.push(TraceStep::DeltaBelowThreshold);
                }
            }
            // pre or post evidence unavailable: the earlier trace step
            // already records the gap
            (Some(_), _, _) => {}
        }
        trace.push(TraceStep::EventEmitted);

        let details = EventDetails {
            schema_version: DETAILS_SCHEMA_VERSION,
            thresholds: ThresholdsInEffect::from_config(cfg),
            scores: DecisionScores {
                peak_motion: interaction.peak_score,
                inventory_delta,
            },
            baseline_age_s,
            captures: CaptureRefs {
                pre: interaction.pre_capture,
                during: interaction.during_capture,
                post: interaction.post_capture,
            },
            trace,
        };

        // interaction_detected, always
        let interaction_event = self
            .insert_event(
                device_id,
                EventType::InteractionDetected,
                interaction.started_at,
                Some(interaction.ended_at),
                interaction.peak_score.clamp(0.0, 1.0),
                &details,
                now,
            )
            .await?;
        for (role, evidence) in [
            (EventImageRole::Pre, &pre),
            (EventImageRole::During, &during),
            (EventImageRole::Post, &post),
        ] {
            if let Some(ev) = evidence {
                self.promote(interaction_event, device_id, interaction.started_at, &ev.capture, role)
                    .await?;
            }
        }
        emitted.push(EmittedEvent {
            event_id: interaction_event,
            event_type: EventType::InteractionDetected,
        });

        // stock_changed, referencing the same pre/post captures
        if stock_changed {
            let confidence = inventory_delta.unwrap_or(0.0).clamp(0.0, 1.0);
            let stock_event = self
                .insert_event(
                    device_id,
                    EventType::StockChanged,
                    interaction.started_at,
                    Some(interaction.ended_at),
                    confidence,
                    &details,
                    now,
                )
                .await?;
            for (role, evidence) in [(EventImageRole::Pre, &pre), (EventImageRole::Post, &post)] {
                if let Some(ev) = evidence {
                    self.promote(stock_event, device_id, interaction.started_at, &ev.capture, role)
                        .await?;
                }
            }
            emitted.push(EmittedEvent {
                event_id: stock_event,
                event_type: EventType::StockChanged,
            });
        }

        // optional external detector enrichment; failures are logged, never
        // fail the pipeline
        if let Some(post_ev) = &post {
            match self.detector.classify(device_id, &post_ev.bytes).await {
                Ok(Some(verdict)) if verdict.label == "empty" => {
                    let mut details = details.clone();
                    details.trace.push(TraceStep::DetectorConsulted);
                    let empty_event = self
                        .insert_event(
                            device_id,
                            EventType::EmptyConfirmed,
                            interaction.started_at,
                            Some(interaction.ended_at),
                            verdict.confidence.clamp(0.0, 1.0),
                            &details,
                            now,
                        )
                        .await?;
                    self.promote(
                        empty_event,
                        device_id,
                        interaction.started_at,
                        &post_ev.capture,
                        EventImageRole::Post,
                    )
                    .await?;
                    emitted.push(EmittedEvent {
                        event_id: empty_event,
                        event_type: EventType::EmptyConfirmed,
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(device_id = %device_id, error = %e, "Detector unavailable");
                }
            }
        }

        for ev in &emitted {
            tracing::info!(
                device_id = %device_id,
                event_id = ev.event_id,
                event_type = %ev.event_type.as_str(),
                started_at = %interaction.started_at,
                "Event emitted"
            );
        }
        Ok(emitted)
    }

    /// Emit `camera_obstructed` for an interaction stuck past the ceiling
    pub async fn emit_obstruction(
        &self,
        device_id: &str,
        cfg: &DeviceConfig,
        report: &ObstructionReport,
        now: DateTime<Utc>,
    ) -> Result<EmittedEvent> {
        let during = self.load_evidence(report.during_capture).await?;
        let details = EventDetails {
            schema_version: DETAILS_SCHEMA_VERSION,
            thresholds: ThresholdsInEffect::from_config(cfg),
            scores: DecisionScores {
                peak_motion: report.peak_score,
                inventory_delta: None,
            },
            baseline_age_s: None,
            captures: CaptureRefs {
                pre: None,
                during: report.during_capture,
                post: None,
            },
            trace: vec![TraceStep::ObstructionCeilingHit, TraceStep::EventEmitted],
        };

        let event_id = self
            .insert_event(
                device_id,
                EventType::CameraObstructed,
                report.started_at,
                Some(report.observed_until),
                report.peak_score.clamp(0.0, 1.0),
                &details,
                now,
            )
            .await?;
        if let Some(ev) = &during {
            self.promote(event_id, device_id, report.started_at, &ev.capture, EventImageRole::During)
                .await?;
        }

        tracing::warn!(
            device_id = %device_id,
            event_id = event_id,
            started_at = %report.started_at,
            "Camera obstruction reported"
        );
        Ok(EmittedEvent {
            event_id,
            event_type: EventType::CameraObstructed,
        })
    }

    /// Emit `scene_shifted` when the stable scene departed from the baseline
    pub async fn emit_scene_shift(
        &self,
        device_id: &str,
        cfg: &DeviceConfig,
        capture_id: i64,
        score: f32,
        baseline_age_s: Option<i64>,
        observed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<EmittedEvent> {
        let evidence = self.load_evidence(Some(capture_id)).await?;
        let details = EventDetails {
            schema_version: DETAILS_SCHEMA_VERSION,
            thresholds: ThresholdsInEffect::from_config(cfg),
            scores: DecisionScores {
                peak_motion: 0.0,
                inventory_delta: Some(score),
            },
            baseline_age_s,
            captures: CaptureRefs {
                pre: None,
                during: Some(capture_id),
                post: None,
            },
            trace: vec![TraceStep::SceneShiftDetected, TraceStep::EventEmitted],
        };

        let event_id = self
            .insert_event(
                device_id,
                EventType::SceneShifted,
                observed_at,
                Some(observed_at),
                score.clamp(0.0, 1.0),
                &details,
                now,
            )
            .await?;
        if let Some(ev) = &evidence {
            self.promote(event_id, device_id, observed_at, &ev.capture, EventImageRole::During)
                .await?;
        }

        tracing::warn!(
            device_id = %device_id,
            event_id = event_id,
            score = score,
            "Scene shift reported"
        );
        Ok(EmittedEvent {
            event_id,
            event_type: EventType::SceneShifted,
        })
    }

    /// Insert an event, idempotent on (device, type, started_at).
    ///
    /// A re-run after a partial write finds the existing row and continues
    /// with promotion instead of duplicating the event.
    async fn insert_event(
        &self,
        device_id: &str,
        event_type: EventType,
        started_at: DateTime<Utc>,
        ended_at: Option<DateTime<Utc>>,
        confidence: f32,
        details: &EventDetails,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let details_json = serde_json::to_string(details)?;
        sqlx::query(
            r#"
            INSERT INTO events (device_id, event_type, started_at, ended_at, confidence, details, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id, event_type, started_at) DO NOTHING
            "#,
        )
        .bind(device_id)
        .bind(event_type.as_str())
        .bind(started_at)
        .bind(ended_at)
        .bind(confidence)
        .bind(&details_json)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT id FROM events WHERE device_id = ? AND event_type = ? AND started_at = ?",
        )
        .bind(device_id)
        .bind(event_type.as_str())
        .bind(started_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }

    /// Promote one evidence capture: copy the staging file into the event
    /// folder, publish the EventImage row only after the copy succeeded,
    /// then transition the capture staging -> event. Every step is
    /// idempotent under re-run.
    async fn promote(
        &self,
        event_id: i64,
        device_id: &str,
        started_at: DateTime<Utc>,
        capture: &Capture,
        role: EventImageRole,
    ) -> Result<()> {
        let source = capture.storage_uri.as_deref().ok_or_else(|| {
            Error::Internal(format!("capture {} has no storage uri", capture.id))
        })?;

        let event_dir = self
            .config
            .events_dir
            .join(device_id)
            .join(started_at.format("%Y-%m-%d").to_string());
        fs::create_dir_all(&event_dir).await?;
        let dest = event_dir.join(format!("{}_{}.jpg", capture.id, role.as_str()));

        // already promoted by an earlier (crashed) run: the original staging
        // file may be gone, but the promoted copy is the evidence
        if capture.storage_class() == crate::models::StorageClass::Event && dest.exists() {
            return Ok(());
        }

        fs::copy(source, &dest).await?;

        sqlx::query(
            r#"
            INSERT INTO event_images (event_id, capture_id, role, path, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(event_id, role) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(capture.id)
        .bind(role.as_str())
        .bind(dest.to_string_lossy().to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        sqlx::query("UPDATE captures SET storage_class = 'event' WHERE id = ? AND storage_class = 'staging'")
            .bind(capture.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Load an evidence capture with its decoded image and raw bytes
    async fn load_evidence(&self, capture_id: Option<i64>) -> Result<Option<Evidence>> {
        let Some(id) = capture_id else {
            return Ok(None);
        };
        let capture = sqlx::query_as::<_, Capture>(
            r#"
            SELECT id, device_id, seq, capture_ts, received_ts, width, height,
                   jpeg_quality, storage_uri, storage_class, analysis_status
            FROM captures WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("capture {}", id)))?;

        let Some(uri) = capture.storage_uri.clone() else {
            return Ok(None);
        };
        let bytes = fs::read(&uri).await?;
        let image = image::load_from_memory(&bytes)?.to_luma8();
        Ok(Some(Evidence {
            capture,
            bytes,
            image,
        }))
    }
}

/// Loaded evidence: row, raw JPEG, decoded grayscale
struct Evidence {
    capture: Capture,
    bytes: Vec<u8>,
    image: image::GrayImage,
}
