//! FrameCache - Previous Frame Cache for Frame Diff Analysis
//!
//! ## Responsibilities
//!
//! - Store the last analyzed frame per device, decoded to grayscale
//! - Provide it to the next frame's motion diff
//! - Treat frames past a staleness ceiling as absent (a device that was
//!   silent for minutes should not diff against ancient history)
//!
//! Cold start (process restart, first frame of a device) simply yields
//! `None`; callers skip the motion diff for that frame.

use chrono::{DateTime, Utc};
use image::GrayImage;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One cached frame with its capture identity
#[derive(Clone)]
pub struct CachedFrame {
    pub capture_id: i64,
    pub received_ts: DateTime<Utc>,
    pub image: Arc<GrayImage>,
}

/// FrameCache configuration
#[derive(Debug, Clone)]
pub struct FrameCacheConfig {
    /// Maximum frame age in seconds before considered stale
    pub max_age_secs: i64,
}

impl Default for FrameCacheConfig {
    fn default() -> Self {
        Self { max_age_secs: 300 }
    }
}

/// Per-device previous-frame cache
pub struct FrameCache {
    frames: RwLock<HashMap<String, CachedFrame>>,
    config: FrameCacheConfig,
}

impl FrameCache {
    pub fn new(config: FrameCacheConfig) -> Self {
        Self {
            frames: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(FrameCacheConfig::default())
    }

    /// Store a frame as the previous frame for a device
    pub async fn store(&self, device_id: &str, frame: CachedFrame) {
        let mut frames = self.frames.write().await;
        frames.insert(device_id.to_string(), frame);
    }

    /// Get the previous frame for a device, as of the given frame timestamp.
    ///
    /// Returns `None` on cold start or when the cached frame is older than
    /// the staleness ceiling.
    pub async fn get(&self, device_id: &str, as_of: DateTime<Utc>) -> Option<CachedFrame> {
        let frames = self.frames.read().await;
        let entry = frames.get(device_id)?;
        let age = as_of.signed_duration_since(entry.received_ts);
        if age.num_seconds() > self.config.max_age_secs {
            tracing::debug!(
                device_id = %device_id,
                age_secs = age.num_seconds(),
                "Previous frame stale, treating as absent"
            );
            return None;
        }
        Some(entry.clone())
    }

    /// Drop the cached frame for a device
    pub async fn clear(&self, device_id: &str) {
        let mut frames = self.frames.write().await;
        frames.remove(device_id);
    }

    /// Number of devices with a cached frame
    pub async fn len(&self) -> usize {
        self.frames.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.frames.read().await.is_empty()
    }
}
