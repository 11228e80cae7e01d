//! BaselineManager - Per-Device Reference Image for Inventory Comparison
//!
//! ## Responsibilities
//!
//! - Maintain a slowly-updated reference image per (device, inventory ROI)
//! - Blend in new frames only while the scene is stable (no interaction in
//!   progress and enough consecutive calm frames)
//! - Expose baseline age for diagnostics and scene-shift heuristics
//! - Persist to the filesystem so a restart keeps the reference
//!
//! A missing baseline is normal (cold start); callers skip the inventory
//! check and log an informational skip, never fail.

use crate::error::Result;
use chrono::{DateTime, Utc};
use image::GrayImage;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;

/// In-memory baseline state
struct BaselineState {
    /// Blended pixels, full frame, f32 to avoid rounding drift
    pixels: Vec<f32>,
    width: u32,
    height: u32,
    last_updated: DateTime<Utc>,
    updates: u64,
}

impl BaselineState {
    fn from_frame(frame: &GrayImage, now: DateTime<Utc>) -> Self {
        Self {
            pixels: frame.pixels().map(|p| p[0] as f32).collect(),
            width: frame.width(),
            height: frame.height(),
            last_updated: now,
            updates: 1,
        }
    }

    /// Exponential blend: baseline = (1 - rate) * baseline + rate * frame
    fn blend(&mut self, frame: &GrayImage, rate: f32, now: DateTime<Utc>) {
        let rate = rate.clamp(0.0, 1.0);
        for (acc, p) in self.pixels.iter_mut().zip(frame.pixels()) {
            *acc = (1.0 - rate) * *acc + rate * p[0] as f32;
        }
        self.last_updated = now;
        self.updates += 1;
    }

    fn render(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            let v = self.pixels[(y * self.width + x) as usize];
            image::Luma([v.round().clamp(0.0, 255.0) as u8])
        })
    }
}

/// BaselineManager configuration
#[derive(Debug, Clone)]
pub struct BaselineManagerConfig {
    /// Directory for persisted baselines; `None` disables persistence
    pub persist_dir: Option<PathBuf>,
}

impl Default for BaselineManagerConfig {
    fn default() -> Self {
        Self { persist_dir: None }
    }
}

/// Per-(device, inventory ROI) baseline store
pub struct BaselineManager {
    baselines: RwLock<HashMap<String, BaselineState>>,
    config: BaselineManagerConfig,
}

fn key(device_id: &str, roi_name: &str) -> String {
    format!("{}/{}", device_id, roi_name)
}

impl BaselineManager {
    pub fn new(config: BaselineManagerConfig) -> Self {
        Self {
            baselines: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(BaselineManagerConfig::default())
    }

    /// Offer a frame to the baseline.
    ///
    /// Blends only when `is_stable` (the caller gates on interaction phase
    /// and `stability_frames_required`); otherwise a no-op. A frame whose
    /// dimensions differ from the stored baseline (resolution change on the
    /// device) resets the baseline to that frame.
    pub async fn observe(
        &self,
        device_id: &str,
        roi_name: &str,
        frame: &GrayImage,
        is_stable: bool,
        rate: f32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !is_stable {
            return Ok(());
        }

        let k = key(device_id, roi_name);
        {
            let mut baselines = self.baselines.write().await;
            match baselines.get_mut(&k) {
                Some(state) if (state.width, state.height) == frame.dimensions() => {
                    state.blend(frame, rate, now);
                }
                Some(state) => {
                    tracing::warn!(
                        device_id = %device_id,
                        roi_name = %roi_name,
                        old = ?(state.width, state.height),
                        new = ?frame.dimensions(),
                        "Frame dimensions changed, resetting baseline"
                    );
                    *state = BaselineState::from_frame(frame, now);
                }
                None => {
                    tracing::info!(
                        device_id = %device_id,
                        roi_name = %roi_name,
                        "Baseline initialized"
                    );
                    baselines.insert(k.clone(), BaselineState::from_frame(frame, now));
                }
            }
        }

        self.persist(device_id, roi_name).await
    }

    /// Latest baseline image, or `None` before the first stable frame.
    pub async fn current(&self, device_id: &str, roi_name: &str) -> Option<Arc<GrayImage>> {
        {
            let baselines = self.baselines.read().await;
            if let Some(state) = baselines.get(&key(device_id, roi_name)) {
                return Some(Arc::new(state.render()));
            }
        }

        // restart fallback
        if let Some(state) = self.load_from_file(device_id, roi_name).await {
            let img = Arc::new(state.render());
            let mut baselines = self.baselines.write().await;
            baselines.insert(key(device_id, roi_name), state);
            return Some(img);
        }
        None
    }

    /// Seconds since the baseline last accepted a frame
    pub async fn age_secs(&self, device_id: &str, roi_name: &str, now: DateTime<Utc>) -> Option<i64> {
        let baselines = self.baselines.read().await;
        baselines
            .get(&key(device_id, roi_name))
            .map(|s| now.signed_duration_since(s.last_updated).num_seconds())
    }

    /// Replace the baseline with the given frame (scene-shift recovery)
    pub async fn reset(
        &self,
        device_id: &str,
        roi_name: &str,
        frame: &GrayImage,
        now: DateTime<Utc>,
    ) -> Result<()> {
        {
            let mut baselines = self.baselines.write().await;
            baselines.insert(
                key(device_id, roi_name),
                BaselineState::from_frame(frame, now),
            );
        }
        self.persist(device_id, roi_name).await
    }

    async fn persist(&self, device_id: &str, roi_name: &str) -> Result<()> {
        let Some(ref dir) = self.config.persist_dir else {
            return Ok(());
        };

        let (img, meta) = {
            let baselines = self.baselines.read().await;
            let Some(state) = baselines.get(&key(device_id, roi_name)) else {
                return Ok(());
            };
            let meta = serde_json::json!({
                "last_updated": state.last_updated.to_rfc3339(),
                "updates": state.updates,
            });
            (state.render(), meta)
        };

        let device_dir = dir.join(device_id);
        fs::create_dir_all(&device_dir).await?;

        let image_path = device_dir.join(format!("{}.png", roi_name));
        // image encoding is synchronous; frames are small and cadence is seconds
        img.save(&image_path)?;

        let meta_path = device_dir.join(format!("{}.meta.json", roi_name));
        fs::write(&meta_path, meta.to_string()).await?;
        Ok(())
    }

    async fn load_from_file(&self, device_id: &str, roi_name: &str) -> Option<BaselineState> {
        let dir = self.config.persist_dir.as_ref()?;
        let device_dir = dir.join(device_id);
        let image_path = device_dir.join(format!("{}.png", roi_name));
        let data = fs::read(&image_path).await.ok()?;
        let img = image::load_from_memory(&data).ok()?.to_luma8();

        let meta_path = device_dir.join(format!("{}.meta.json", roi_name));
        let last_updated = match fs::read_to_string(&meta_path).await {
            Ok(raw) => serde_json::from_str::<serde_json::Value>(&raw)
                .ok()
                .and_then(|v| {
                    v["last_updated"]
                        .as_str()
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                })
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
            Err(_) => Utc::now(),
        };

        let mut state = BaselineState::from_frame(&img, last_updated);
        state.updates = 0;
        tracing::info!(
            device_id = %device_id,
            roi_name = %roi_name,
            "Baseline restored from disk"
        );
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(value: u8) -> GrayImage {
        GrayImage::from_pixel(8, 8, image::Luma([value]))
    }

    #[tokio::test]
    async fn test_cold_start_absent() {
        let mgr = BaselineManager::with_defaults();
        assert!(mgr.current("cam-1", "shelf").await.is_none());
        assert!(mgr.age_secs("cam-1", "shelf", Utc::now()).await.is_none());
    }

    #[tokio::test]
    async fn test_unstable_frames_are_ignored() {
        let mgr = BaselineManager::with_defaults();
        mgr.observe("cam-1", "shelf", &flat(50), false, 0.2, Utc::now())
            .await
            .unwrap();
        assert!(mgr.current("cam-1", "shelf").await.is_none());
    }

    #[tokio::test]
    async fn test_blend_moves_toward_new_frame() {
        let mgr = BaselineManager::with_defaults();
        let now = Utc::now();
        mgr.observe("cam-1", "shelf", &flat(100), true, 0.2, now)
            .await
            .unwrap();
        mgr.observe("cam-1", "shelf", &flat(200), true, 0.5, now)
            .await
            .unwrap();
        let img = mgr.current("cam-1", "shelf").await.unwrap();
        // 0.5 * 100 + 0.5 * 200 = 150
        assert_eq!(img.get_pixel(0, 0)[0], 150);
    }

    #[tokio::test]
    async fn test_reset_replaces_baseline() {
        let mgr = BaselineManager::with_defaults();
        let now = Utc::now();
        mgr.observe("cam-1", "shelf", &flat(100), true, 0.2, now)
            .await
            .unwrap();
        mgr.reset("cam-1", "shelf", &flat(10), now).await.unwrap();
        let img = mgr.current("cam-1", "shelf").await.unwrap();
        assert_eq!(img.get_pixel(0, 0)[0], 10);
    }

    #[tokio::test]
    async fn test_dimension_change_resets() {
        let mgr = BaselineManager::with_defaults();
        let now = Utc::now();
        mgr.observe("cam-1", "shelf", &flat(100), true, 0.2, now)
            .await
            .unwrap();
        let bigger = GrayImage::from_pixel(16, 16, image::Luma([30]));
        mgr.observe("cam-1", "shelf", &bigger, true, 0.2, now)
            .await
            .unwrap();
        let img = mgr.current("cam-1", "shelf").await.unwrap();
        assert_eq!(img.dimensions(), (16, 16));
        assert_eq!(img.get_pixel(0, 0)[0], 30);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let config = BaselineManagerConfig {
            persist_dir: Some(tmp.path().to_path_buf()),
        };
        let now = Utc::now();
        {
            let mgr = BaselineManager::new(config.clone());
            mgr.observe("cam-1", "shelf", &flat(77), true, 0.2, now)
                .await
                .unwrap();
        }
        // fresh manager, same directory: restart
        let mgr = BaselineManager::new(config);
        let img = mgr.current("cam-1", "shelf").await.unwrap();
        assert_eq!(img.get_pixel(0, 0)[0], 77);
    }
}
