//! Dostawca HTTP: POST do zewnętrznego API moderacji obrazów.
//!
//! Żądanie: JSON `{"url": ".."}` albo surowe bajty (`application/octet-stream`),
//! gdy `send_bytes=true` lub nie znamy URL-a. Klucz w `Authorization: Bearer`.
//! Odpowiedź: `{"detected": bool, "confidence": float, "labels": [..]}`.

use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use serde::Deserialize;
use serde_json::json;

use super::{ImageData, ProviderVerdict};
use crate::config::HttpProviderConfig;

#[derive(Debug, Clone)]
pub struct HttpProvider {
    cfg: HttpProviderConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    detected: bool,
    confidence: f64,
    #[serde(default)]
    labels: Vec<String>,
}

impl HttpProvider {
    pub fn new(cfg: HttpProviderConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("Tigris-ImageGuard/1.0")
            .connect_timeout(Duration::from_millis(1500))
            .timeout(timeout)
            .build()
            .context("classifier http client")?;
        Ok(Self { cfg, client })
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub(super) async fn call(&self, image: &ImageData) -> Result<ProviderVerdict> {
        let req = self
            .client
            .post(&self.cfg.endpoint)
            .bearer_auth(&self.cfg.api_key);

        let req = match (&image.url, self.cfg.send_bytes) {
            (Some(url), false) => req.json(&json!({ "url": url })),
            _ => req
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(image.bytes.to_vec()),
        };

        let resp = req.send().await.context("provider request")?;
        let status = resp.status();
        if !status.is_success() {
            bail!("provider returned {status}");
        }

        let body: ProviderResponse = resp.json().await.context("malformed provider response")?;
        if !body.confidence.is_finite() {
            bail!("provider returned non-finite confidence");
        }
        Ok(ProviderVerdict {
            detected: body.detected,
            confidence: body.confidence,
            labels: body.labels,
        })
    }
}
