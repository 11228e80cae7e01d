//! ConfigStore - Device Configuration and ROI Repository
//!
//! ## Responsibilities
//!
//! - Per-device tunables, resolved against built-in defaults
//! - ROI definitions (at most one active per (device, name))
//! - Device heartbeat / last-seen upkeep
//!
//! The analysis worker reads the current config for every frame it
//! processes; nothing here caches across a device config version bump, so
//! config changes take effect on the next frame without a restart.

use crate::error::{Error, Result};
use crate::models::{Device, DeviceConfig, Roi, RoiKind};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

/// Device column list shared by the queries below
const DEVICE_COLUMNS: &str = r#"
    device_id, device_key, last_seen, rssi, battery_mv, fw_version,
    capture_interval_s, burst_fps, burst_duration_s, burst_cooldown_s,
    interaction_threshold, interaction_min_frames, interaction_end_timeout_s,
    inventory_change_threshold, baseline_update_rate, stability_frames_required,
    max_interaction_s, config_version, created_at, updated_at
"#;

/// Repository over the devices and rois tables
#[derive(Clone)]
pub struct ConfigStore {
    pool: SqlitePool,
}

impl ConfigStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a device row
    pub async fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        let query = format!("SELECT {} FROM devices WHERE device_id = ?", DEVICE_COLUMNS);
        let device = sqlx::query_as::<_, Device>(&query)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(device)
    }

    /// All known devices, for the dashboard
    pub async fn get_all_devices(&self) -> Result<Vec<Device>> {
        let query = format!("SELECT {} FROM devices ORDER BY device_id", DEVICE_COLUMNS);
        Ok(sqlx::query_as::<_, Device>(&query)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Effective config for a device. Unknown devices get the built-in
    /// defaults; unset columns fall back per field.
    pub async fn get_device_config(&self, device_id: &str) -> Result<DeviceConfig> {
        Ok(match self.get_device(device_id).await? {
            Some(device) => DeviceConfig::from_device(&device),
            None => DeviceConfig::default(),
        })
    }

    /// Upsert the device row and stamp last_seen
    pub async fn touch_device(&self, device_id: &str, device_key: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (device_id, device_key, last_seen, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET last_seen = excluded.last_seen
            "#,
        )
        .bind(device_id)
        .bind(device_key)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a heartbeat with optional device telemetry
    pub async fn record_heartbeat(
        &self,
        device_id: &str,
        device_key: &str,
        rssi: Option<i32>,
        battery_mv: Option<i32>,
        fw_version: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (device_id, device_key, last_seen, rssi, battery_mv, fw_version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
                last_seen = excluded.last_seen,
                rssi = excluded.rssi,
                battery_mv = excluded.battery_mv,
                fw_version = excluded.fw_version
            "#,
        )
        .bind(device_id)
        .bind(device_key)
        .bind(now)
        .bind(rssi)
        .bind(battery_mv)
        .bind(fw_version)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Active ROIs for a device
    pub async fn get_active_rois(&self, device_id: &str) -> Result<Vec<Roi>> {
        Ok(sqlx::query_as::<_, Roi>(
            r#"
            SELECT id, device_id, name, kind, x, y, w, h, active, created_at
            FROM rois WHERE device_id = ? AND active = 1
            ORDER BY name
            "#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Replace the active ROI of the given name, keeping history rows inactive
    pub async fn upsert_roi(
        &self,
        device_id: &str,
        name: &str,
        kind: RoiKind,
        x: f32,
        y: f32,
        w: f32,
        h: f32,
    ) -> Result<()> {
        if !(0.0..=1.0).contains(&x)
            || !(0.0..=1.0).contains(&y)
            || w <= 0.0
            || h <= 0.0
            || x + w > 1.0
            || y + h > 1.0
        {
            return Err(Error::Validation(format!(
                "roi '{}' out of normalized bounds",
                name
            )));
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE rois SET active = 0 WHERE device_id = ? AND name = ? AND active = 1")
            .bind(device_id)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO rois (device_id, name, kind, x, y, w, h, active, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(device_id)
        .bind(name)
        .bind(kind.as_str())
        .bind(x)
        .bind(y)
        .bind(w)
        .bind(h)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Bump config_version and apply tunable overrides via a partial update
    pub async fn update_device_config(
        &self,
        device_id: &str,
        interaction_threshold: Option<f32>,
        interaction_min_frames: Option<i32>,
        interaction_end_timeout_s: Option<f32>,
        inventory_change_threshold: Option<f32>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE devices SET
                interaction_threshold = COALESCE(?, interaction_threshold),
                interaction_min_frames = COALESCE(?, interaction_min_frames),
                interaction_end_timeout_s = COALESCE(?, interaction_end_timeout_s),
                inventory_change_threshold = COALESCE(?, inventory_change_threshold),
                config_version = config_version + 1,
                updated_at = ?
            WHERE device_id = ?
            "#,
        )
        .bind(interaction_threshold)
        .bind(interaction_min_frames)
        .bind(interaction_end_timeout_s)
        .bind(inventory_change_threshold)
        .bind(Utc::now())
        .bind(device_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("device {}", device_id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;

    #[tokio::test]
    async fn test_unknown_device_gets_defaults() {
        let pool = test_pool().await;
        let store = ConfigStore::new(pool);
        let cfg = store.get_device_config("ghost").await.unwrap();
        assert_eq!(cfg, DeviceConfig::default());
    }

    #[tokio::test]
    async fn test_config_hot_reload() {
        let pool = test_pool().await;
        let store = ConfigStore::new(pool);
        let now = Utc::now();
        store.touch_device("cam-1", "dev-key", now).await.unwrap();

        let before = store.get_device_config("cam-1").await.unwrap();
        assert!((before.interaction_threshold - 0.3).abs() < f32::EPSILON);

        store
            .update_device_config("cam-1", Some(0.5), Some(4), None, None)
            .await
            .unwrap();

        let after = store.get_device_config("cam-1").await.unwrap();
        assert!((after.interaction_threshold - 0.5).abs() < f32::EPSILON);
        assert_eq!(after.interaction_min_frames, 4);
        assert_eq!(after.config_version, before.config_version + 1);
        // untouched fields keep defaults
        assert!((after.interaction_end_timeout_s - 3.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_roi_single_active_per_name() {
        let pool = test_pool().await;
        let store = ConfigStore::new(pool);
        store
            .upsert_roi("cam-1", "interaction_roi", RoiKind::Interaction, 0.0, 0.0, 1.0, 1.0)
            .await
            .unwrap();
        store
            .upsert_roi("cam-1", "interaction_roi", RoiKind::Interaction, 0.2, 0.2, 0.5, 0.5)
            .await
            .unwrap();

        let rois = store.get_active_rois("cam-1").await.unwrap();
        assert_eq!(rois.len(), 1);
        assert!((rois[0].x - 0.2).abs() < f32::EPSILON);
        assert_eq!(rois[0].kind(), RoiKind::Interaction);
    }

    #[tokio::test]
    async fn test_malformed_roi_rejected() {
        let pool = test_pool().await;
        let store = ConfigStore::new(pool);
        let err = store
            .upsert_roi("cam-1", "bad", RoiKind::Inventory, 0.8, 0.0, 0.5, 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_heartbeat_updates_telemetry() {
        let pool = test_pool().await;
        let store = ConfigStore::new(pool);
        let now = Utc::now();
        store
            .record_heartbeat("cam-1", "dev-key", Some(-61), Some(3900), Some("1.2.0"), now)
            .await
            .unwrap();
        let device = store.get_device("cam-1").await.unwrap().unwrap();
        assert_eq!(device.rssi, Some(-61));
        assert_eq!(device.battery_mv, Some(3900));
        assert_eq!(device.fw_version.as_deref(), Some("1.2.0"));
    }
}
