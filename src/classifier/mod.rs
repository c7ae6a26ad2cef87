//! Adapter klasyfikatora zewnętrznego.
//!
//! Zamknięty zbiór dostawców (`Provider`) za jednym interfejsem
//! `ImageClassifier::classify`. Dostawca wybierany raz, przy starcie, według
//! `classifier.priority`: wygrywa pierwszy skonfigurowany. Jedno wywołanie =
//! jeden dostawca, bez głosowania.
//!
//! Każdy błąd dostawcy (sieć, status != 2xx, timeout, zły JSON) zamienia się w
//! wynik `detected=false, confidence=0, error=Some(..)`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ClassifierConfig;

pub mod http;
pub mod nudenet;

pub use http::HttpProvider;
pub use nudenet::NudeNetProvider;

/// Obrazek przekazywany do dostawcy: zawsze bajty, opcjonalnie źródłowy URL.
#[derive(Debug, Clone)]
pub struct ImageData {
    pub bytes: Arc<[u8]>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiDetectionResult {
    pub detected: bool,
    pub confidence: f64,
    pub provider: String,
    pub labels: Vec<String>,
    pub processing_time_ms: u64,
    pub error: Option<String>,
}

impl ApiDetectionResult {
    pub fn failure(provider: impl Into<String>, error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            detected: false,
            confidence: 0.0,
            provider: provider.into(),
            labels: Vec::new(),
            processing_time_ms: elapsed.as_millis() as u64,
            error: Some(error.into()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

#[async_trait]
pub trait ImageClassifier: Send + Sync {
    async fn classify(&self, image: &ImageData) -> ApiDetectionResult;
}

/// Surowa odpowiedź dostawcy przed normalizacją.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderVerdict {
    pub detected: bool,
    pub confidence: f64,
    pub labels: Vec<String>,
}

pub enum Provider {
    Http(HttpProvider),
    NudeNet(NudeNetProvider),
}

impl Provider {
    pub fn name(&self) -> &str {
        match self {
            Provider::Http(p) => p.name(),
            Provider::NudeNet(_) => "nudenet",
        }
    }

    async fn call(&self, image: &ImageData) -> anyhow::Result<ProviderVerdict> {
        match self {
            Provider::Http(p) => p.call(image).await,
            Provider::NudeNet(p) => p.call(image).await,
        }
    }
}

pub struct ClassifierAdapter {
    provider: Option<Provider>,
    timeout: Duration,
}

impl ClassifierAdapter {
    pub fn new(provider: Option<Provider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    /// Pierwszy dostawca z `priority`, który ma sekcję w konfiguracji.
    pub fn from_config(cfg: &ClassifierConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(cfg.timeout_secs.max(1));
        let mut chosen = None;
        for name in &cfg.priority {
            match name.trim().to_ascii_lowercase().as_str() {
                "http" => {
                    if let Some(h) = &cfg.http {
                        chosen = Some(Provider::Http(HttpProvider::new(h.clone(), timeout)?));
                        break;
                    }
                }
                "nudenet" => {
                    if let Some(n) = &cfg.nudenet {
                        chosen = Some(Provider::NudeNet(NudeNetProvider::new(n.clone())));
                        break;
                    }
                }
                other => tracing::warn!(provider = other, "unknown classifier provider in priority list"),
            }
        }
        match &chosen {
            Some(p) => tracing::info!(provider = p.name(), timeout_s = timeout.as_secs(), "classifier provider selected"),
            None => tracing::warn!("no classifier provider configured; only the hash pre-filter will flag images"),
        }
        Ok(Self::new(chosen, timeout))
    }

    pub fn provider_name(&self) -> Option<&str> {
        self.provider.as_ref().map(Provider::name)
    }
}

#[async_trait]
impl ImageClassifier for ClassifierAdapter {
    async fn classify(&self, image: &ImageData) -> ApiDetectionResult {
        let started = Instant::now();
        let Some(provider) = &self.provider else {
            return ApiDetectionResult::failure("none", "no classifier provider configured", started.elapsed());
        };
        let name = provider.name().to_string();

        let res = match tokio::time::timeout(self.timeout, provider.call(image)).await {
            Ok(Ok(v)) => ApiDetectionResult {
                detected: v.detected,
                confidence: clamp_unit(v.confidence),
                provider: name,
                labels: v.labels,
                processing_time_ms: started.elapsed().as_millis() as u64,
                error: None,
            },
            Ok(Err(e)) => ApiDetectionResult::failure(name, format!("{e:#}"), started.elapsed()),
            Err(_) => ApiDetectionResult::failure(
                name,
                format!("timed out after {}s", self.timeout.as_secs_f32()),
                started.elapsed(),
            ),
        };

        if let Some(err) = &res.error {
            // fail-open: błąd dostawcy => "nie wykryto"
            tracing::warn!(provider = %res.provider, error = %err, "classifier provider failed, treating as not detected");
        }
        res
    }
}

pub(crate) fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}
