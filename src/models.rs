//! Core data model
//!
//! Row structs and status enums for devices, ROIs, captures, jobs, events
//! and evidence images. Statuses are stored as TEXT in SQLite and converted
//! through the enums below; the enums own every legal transition check.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Device entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Device {
    pub device_id: String,
    pub device_key: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub rssi: Option<i32>,
    pub battery_mv: Option<i32>,
    pub fw_version: Option<String>,
    pub capture_interval_s: Option<i32>,
    pub burst_fps: Option<i32>,
    pub burst_duration_s: Option<i32>,
    pub burst_cooldown_s: Option<i32>,
    pub interaction_threshold: Option<f32>,
    pub interaction_min_frames: Option<i32>,
    pub interaction_end_timeout_s: Option<f32>,
    pub inventory_change_threshold: Option<f32>,
    pub baseline_update_rate: Option<f32>,
    pub stability_frames_required: Option<i32>,
    pub max_interaction_s: Option<i32>,
    pub config_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Effective per-device tunables, after filling unset columns with defaults.
///
/// Read fresh for every processed frame so a config change takes effect on
/// the next frame without restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub capture_interval_s: i32,
    pub burst_fps: i32,
    pub burst_duration_s: i32,
    pub burst_cooldown_s: i32,
    pub interaction_threshold: f32,
    pub interaction_min_frames: u32,
    pub interaction_end_timeout_s: f32,
    pub inventory_change_threshold: f32,
    pub baseline_update_rate: f32,
    pub stability_frames_required: u32,
    pub max_interaction_s: i32,
    pub config_version: i64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            capture_interval_s: 30,
            burst_fps: 2,
            burst_duration_s: 15,
            burst_cooldown_s: 60,
            interaction_threshold: 0.3,
            interaction_min_frames: 3,
            interaction_end_timeout_s: 3.0,
            inventory_change_threshold: 0.25,
            baseline_update_rate: 0.2,
            stability_frames_required: 3,
            max_interaction_s: 300,
            config_version: 1,
        }
    }
}

impl DeviceConfig {
    /// Merge a device row over the built-in defaults.
    pub fn from_device(device: &Device) -> Self {
        let d = Self::default();
        Self {
            capture_interval_s: device.capture_interval_s.unwrap_or(d.capture_interval_s),
            burst_fps: device.burst_fps.unwrap_or(d.burst_fps),
            burst_duration_s: device.burst_duration_s.unwrap_or(d.burst_duration_s),
            burst_cooldown_s: device.burst_cooldown_s.unwrap_or(d.burst_cooldown_s),
            interaction_threshold: device
                .interaction_threshold
                .unwrap_or(d.interaction_threshold),
            interaction_min_frames: device
                .interaction_min_frames
                .map(|v| v.max(1) as u32)
                .unwrap_or(d.interaction_min_frames),
            interaction_end_timeout_s: device
                .interaction_end_timeout_s
                .unwrap_or(d.interaction_end_timeout_s),
            inventory_change_threshold: device
                .inventory_change_threshold
                .unwrap_or(d.inventory_change_threshold),
            baseline_update_rate: device.baseline_update_rate.unwrap_or(d.baseline_update_rate),
            stability_frames_required: device
                .stability_frames_required
                .map(|v| v.max(1) as u32)
                .unwrap_or(d.stability_frames_required),
            max_interaction_s: device.max_interaction_s.unwrap_or(d.max_interaction_s),
            config_version: device.config_version,
        }
    }
}

/// ROI role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoiKind {
    Interaction,
    Inventory,
    Ignore,
}

impl RoiKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoiKind::Interaction => "interaction",
            RoiKind::Inventory => "inventory",
            RoiKind::Ignore => "ignore",
        }
    }
}

impl From<&str> for RoiKind {
    fn from(s: &str) -> Self {
        match s {
            "interaction" => RoiKind::Interaction,
            "inventory" => RoiKind::Inventory,
            _ => RoiKind::Ignore,
        }
    }
}

/// Named rectangle in normalized [0,1] coordinates, scoped to a device
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Roi {
    pub id: i64,
    pub device_id: String,
    pub name: String,
    /// Stored as TEXT, converted via RoiKind
    pub kind: String,
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Roi {
    pub fn kind(&self) -> RoiKind {
        RoiKind::from(self.kind.as_str())
    }
}

/// Capture storage class lifecycle: staging -> event is append-only,
/// staging -> discarded is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageClass {
    Staging,
    Event,
    Debug,
    Discarded,
}

impl StorageClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageClass::Staging => "staging",
            StorageClass::Event => "event",
            StorageClass::Debug => "debug",
            StorageClass::Discarded => "discarded",
        }
    }

    /// Legal storage class transitions
    pub fn can_transition_to(&self, next: StorageClass) -> bool {
        matches!(
            (self, next),
            (StorageClass::Staging, StorageClass::Event)
                | (StorageClass::Staging, StorageClass::Discarded)
                | (StorageClass::Staging, StorageClass::Debug)
                | (StorageClass::Debug, StorageClass::Discarded)
        )
    }
}

impl From<&str> for StorageClass {
    fn from(s: &str) -> Self {
        match s {
            "event" => StorageClass::Event,
            "debug" => StorageClass::Debug,
            "discarded" => StorageClass::Discarded,
            _ => StorageClass::Staging,
        }
    }
}

/// Per-frame analysis status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Queued,
    Processing,
    Processed,
    Failed,
    Skipped,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Queued => "queued",
            AnalysisStatus::Processing => "processing",
            AnalysisStatus::Processed => "processed",
            AnalysisStatus::Failed => "failed",
            AnalysisStatus::Skipped => "skipped",
        }
    }
}

impl From<&str> for AnalysisStatus {
    fn from(s: &str) -> Self {
        match s {
            "processing" => AnalysisStatus::Processing,
            "processed" => AnalysisStatus::Processed,
            "failed" => AnalysisStatus::Failed,
            "skipped" => AnalysisStatus::Skipped,
            _ => AnalysisStatus::Queued,
        }
    }
}

/// Capture entity (one row per received frame)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Capture {
    pub id: i64,
    pub device_id: String,
    pub seq: Option<i64>,
    pub capture_ts: Option<String>,
    /// Receive timestamp, the ordering source of truth
    pub received_ts: DateTime<Utc>,
    pub width: i32,
    pub height: i32,
    pub jpeg_quality: Option<i32>,
    pub storage_uri: Option<String>,
    pub storage_class: String,
    pub analysis_status: String,
}

impl Capture {
    pub fn storage_class(&self) -> StorageClass {
        StorageClass::from(self.storage_class.as_str())
    }

    pub fn analysis_status(&self) -> AnalysisStatus {
        AnalysisStatus::from(self.analysis_status.as_str())
    }
}

/// Job status lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }
}

impl From<&str> for JobStatus {
    fn from(s: &str) -> Self {
        match s {
            "running" => JobStatus::Running,
            "done" => JobStatus::Done,
            "failed" => JobStatus::Failed,
            "dead" => JobStatus::Dead,
            _ => JobStatus::Queued,
        }
    }
}

/// Job entity (one row per capture requiring analysis)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: i64,
    pub capture_id: i64,
    pub status: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub retry_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub created_ts: DateTime<Utc>,
    pub updated_ts: DateTime<Utc>,
}

impl Job {
    pub fn status(&self) -> JobStatus {
        JobStatus::from(self.status.as_str())
    }
}

/// Activity event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    InteractionDetected,
    StockChanged,
    EmptyConfirmed,
    CameraObstructed,
    SceneShifted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::InteractionDetected => "interaction_detected",
            EventType::StockChanged => "stock_changed",
            EventType::EmptyConfirmed => "empty_confirmed",
            EventType::CameraObstructed => "camera_obstructed",
            EventType::SceneShifted => "scene_shifted",
        }
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        match s {
            "stock_changed" => EventType::StockChanged,
            "empty_confirmed" => EventType::EmptyConfirmed,
            "camera_obstructed" => EventType::CameraObstructed,
            "scene_shifted" => EventType::SceneShifted,
            _ => EventType::InteractionDetected,
        }
    }
}

/// Activity event (immutable once created)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Event {
    pub id: i64,
    pub device_id: String,
    pub event_type: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub confidence: f32,
    /// Versioned EventDetails JSON
    pub details: String,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        EventType::from(self.event_type.as_str())
    }
}

/// Role of an evidence image within an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventImageRole {
    Pre,
    Post,
    During,
    Annotated,
    Thumb,
}

impl EventImageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventImageRole::Pre => "pre",
            EventImageRole::Post => "post",
            EventImageRole::During => "during",
            EventImageRole::Annotated => "annotated",
            EventImageRole::Thumb => "thumb",
        }
    }
}

/// Link from an event to an evidence capture
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventImage {
    pub id: i64,
    pub event_id: i64,
    pub capture_id: i64,
    pub role: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
}
