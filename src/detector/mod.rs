//! Detector - Optional Pluggable Frame Classifier
//!
//! The default analysis path is pure pixel statistics; this capability
//! exists so a future external model (e.g. a Coral accelerator service)
//! can enrich event decisions without rewiring the emitter. `Noop` is the
//! shipped default and never produces a verdict.

use crate::error::Result;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Classification verdict from an external detector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorVerdict {
    pub label: String,
    pub confidence: f32,
}

/// Detector capability, injected into the event emitter
pub enum Detector {
    /// ML-free default: never produces a verdict
    Noop,
    /// Remote classifier service
    External(ExternalDetector),
}

impl Detector {
    /// Classify one JPEG frame. `Ok(None)` means "no opinion".
    pub async fn classify(&self, device_id: &str, jpeg: &[u8]) -> Result<Option<DetectorVerdict>> {
        match self {
            Detector::Noop => Ok(None),
            Detector::External(d) => d.classify(device_id, jpeg).await,
        }
    }
}

/// HTTP adapter for a remote classifier
pub struct ExternalDetector {
    client: reqwest::Client,
    base_url: String,
}

impl ExternalDetector {
    pub fn new(base_url: String) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(10))
    }

    pub fn with_timeout(base_url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self { client, base_url }
    }

    async fn classify(&self, device_id: &str, jpeg: &[u8]) -> Result<Option<DetectorVerdict>> {
        let form = Form::new()
            .text("device_id", device_id.to_string())
            .part(
                "image",
                Part::bytes(jpeg.to_vec())
                    .file_name("frame.jpg")
                    .mime_str("image/jpeg")?,
            );

        let resp = self
            .client
            .post(format!("{}/api/v1/classify", self.base_url))
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;

        let verdict: DetectorVerdict = resp.json().await?;
        tracing::debug!(
            device_id = %device_id,
            label = %verdict.label,
            confidence = verdict.confidence,
            "External detector verdict"
        );
        Ok(Some(verdict))
    }
}
