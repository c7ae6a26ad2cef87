//! Pojedynczy skan: pobranie -> pre-filtr hashy -> klasyfikator -> polityka.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classifier::{ImageClassifier, ImageData};
use crate::download::Downloader;
use crate::error::ScanError;
use crate::policy;
use crate::prefilter::HashPrefilter;

#[derive(Debug, Clone)]
pub enum ImageRef {
    Url(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub image: ImageRef,
    pub submitted_at: DateTime<Utc>,
}

impl ScanRequest {
    pub fn new(image: ImageRef) -> Self {
        Self {
            image,
            submitted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum DetectionMethod {
    HashMatch,
    Provider(String),
    None,
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionMethod::HashMatch => f.write_str("hash_match"),
            DetectionMethod::Provider(name) => f.write_str(name),
            DetectionMethod::None => f.write_str("none"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub flagged: bool,
    pub requires_review: bool,
    pub confidence: f64,
    pub method: DetectionMethod,
    pub perceptual_hash: String,
    pub processing_time_ms: u64,
}

pub struct Detector {
    downloader: Downloader,
    prefilter: HashPrefilter,
    classifier: Arc<dyn ImageClassifier>,
    detection_threshold: f64,
    review_threshold: f64,
}

impl Detector {
    pub fn new(
        downloader: Downloader,
        prefilter: HashPrefilter,
        classifier: Arc<dyn ImageClassifier>,
        detection_threshold: f64,
        review_threshold: f64,
    ) -> Self {
        Self {
            downloader,
            prefilter,
            classifier,
            detection_threshold,
            review_threshold,
        }
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    pub fn prefilter(&self) -> &HashPrefilter {
        &self.prefilter
    }

    pub async fn scan(&self, req: ScanRequest) -> Result<DetectionResult, ScanError> {
        let started = Instant::now();

        let (bytes, url): (Arc<[u8]>, Option<String>) = match req.image {
            ImageRef::Url(url) => {
                let bytes = self.downloader.fetch(&url).await.inspect_err(|e| {
                    tracing::warn!(url = %url, error = %e, "image download failed");
                })?;
                (Arc::from(bytes), Some(url))
            }
            ImageRef::Bytes(b) => {
                let max = self.downloader.max_bytes();
                if b.len() as u64 > max {
                    return Err(ScanError::download(format!("image exceeds {max} bytes")));
                }
                (Arc::from(b), None)
            }
        };

        let pre = self.prefilter.prefilter(bytes.clone()).await.inspect_err(|e| {
            tracing::warn!(error = %e, "perceptual hash pre-filter failed");
        })?;
        let perceptual_hash = pre.hash.to_hex();

        if pre.matched {
            tracing::info!(
                known_id = pre.matched_hash.as_ref().map(|k| k.id),
                similarity = pre.similarity,
                "known hash matched, classifier skipped"
            );
            return Ok(DetectionResult {
                flagged: true,
                requires_review: false,
                confidence: 1.0,
                method: DetectionMethod::HashMatch,
                perceptual_hash,
                processing_time_ms: started.elapsed().as_millis() as u64,
            });
        }

        let api = self.classifier.classify(&ImageData { bytes, url }).await;

        // fail-open: błąd dostawcy nie może dać flagged ani review
        let (decision, method) = if api.is_failure() {
            (policy::Decision::PASS, DetectionMethod::None)
        } else {
            (
                policy::decide(api.confidence, self.detection_threshold, self.review_threshold),
                DetectionMethod::Provider(api.provider.clone()),
            )
        };

        Ok(DetectionResult {
            flagged: decision.flagged,
            requires_review: decision.requires_review,
            confidence: if api.is_failure() { 0.0 } else { api.confidence },
            method,
            perceptual_hash,
            processing_time_ms: started.elapsed().as_millis() as u64,
        })
    }
}
