//! Fasada silnika: zgłoszenie obrazka -> skan -> zapis detekcji -> eskalacja/przegląd.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;

use crate::classifier::ImageClassifier;
use crate::config::Settings;
use crate::download::Downloader;
use crate::error::{EscalationError, ScanError};
use crate::escalation::{
    ApprovalReport, DetectionAlert, Enforcer, EscalationEngine, EscalationOutcome, Notifier, ReviewAlert,
    ReviewDecision,
};
use crate::prefilter::{HashPrefilter, HashStore};
use crate::scanner::{DetectionResult, Detector, ImageRef, ScanRequest};
use crate::scheduler::ScanScheduler;
use crate::store::{NewDetection, NewReview, ReviewItem, ReviewKind, ReviewStatus, Store};

#[derive(Debug, Clone)]
pub struct ImageSubmission {
    pub guild_id: u64,
    pub channel_id: u64,
    pub message_id: u64,
    pub user_id: u64,
    pub image: ImageRef,
    /// Rozmiar z metadanych załącznika (sprawdzany przed kolejką).
    pub declared_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    /// `None` gdy obrazek przeszedł (nic nie zapisujemy).
    pub detection_id: Option<i64>,
    pub result: DetectionResult,
    pub escalation: Option<EscalationOutcome>,
    pub review: Option<ReviewItem>,
    pub delete_message: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum ReviewResolution {
    GlobalBan(ApprovalReport),
    OffenseConfirmed(EscalationOutcome),
    AlreadyDecided { status: ReviewStatus },
}

pub struct Engine {
    store: Arc<dyn Store>,
    scheduler: ScanScheduler,
    escalation: Arc<EscalationEngine>,
    max_image_bytes: u64,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        scheduler: ScanScheduler,
        escalation: Arc<EscalationEngine>,
        max_image_bytes: u64,
    ) -> Self {
        Self {
            store,
            scheduler,
            escalation,
            max_image_bytes,
        }
    }

    /// Składa cały łańcuch z konfiguracji; kolaboratorzy wstrzykiwani z zewnątrz.
    pub fn from_settings(
        settings: &Settings,
        store: Arc<dyn Store>,
        classifier: Arc<dyn ImageClassifier>,
        enforcer: Arc<dyn Enforcer>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let det = &settings.detection;
        let downloader = Downloader::new(det.max_image_bytes(), det.allowed_hosts.clone())?;
        let hashes = HashStore::new(
            store.clone(),
            det.hash_size,
            Duration::from_secs(det.hash_cache_ttl_secs),
        );
        let detector = Arc::new(Detector::new(
            downloader,
            HashPrefilter::new(hashes, det.hash_match_threshold),
            classifier,
            det.detection_threshold,
            det.review_threshold,
        ));
        let scheduler = ScanScheduler::new(detector, det.max_concurrent_scans);
        let escalation = Arc::new(EscalationEngine::new(
            store.clone(),
            enforcer,
            notifier,
            settings.escalation.clone(),
        ));
        Ok(Self::new(store, scheduler, escalation, det.max_image_bytes()))
    }

    pub fn hashes(&self) -> &HashStore {
        self.scheduler.detector().prefilter().hashes()
    }

    pub fn downloader(&self) -> &Downloader {
        self.scheduler.detector().downloader()
    }

    pub fn scheduler(&self) -> &ScanScheduler {
        &self.scheduler
    }

    pub fn escalation(&self) -> &Arc<EscalationEngine> {
        &self.escalation
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// `Ok(None)` gdy detekcja jest wyłączona w gildii.
    pub async fn process_image(&self, sub: ImageSubmission) -> Result<Option<ProcessOutcome>> {
        let gcfg = self.store.guild_config(sub.guild_id).await?;
        if !gcfg.detection_enabled {
            return Ok(None);
        }

        if let Some(size) = sub.declared_size {
            if size > self.max_image_bytes {
                tracing::warn!(gid = sub.guild_id, uid = sub.user_id, size, "image over size limit, not scanned");
                return Err(ScanError::download(format!(
                    "image too large ({size} > {} bytes)",
                    self.max_image_bytes
                ))
                .into());
            }
        }

        let result = self.scheduler.submit(ScanRequest::new(sub.image)).await?;
        if !result.flagged && !result.requires_review {
            return Ok(Some(ProcessOutcome {
                detection_id: None,
                result,
                escalation: None,
                review: None,
                delete_message: false,
            }));
        }

        // Od tego miejsca skan się udał: błędy zapisu/eskalacji logujemy, ale
        // decyzja o usunięciu wiadomości zawsze wraca do wywołującego.
        let delete_message = result.flagged && gcfg.auto_delete;

        let detection_id = match self
            .store
            .insert_detection(&NewDetection {
                guild_id: sub.guild_id,
                channel_id: sub.channel_id,
                message_id: sub.message_id,
                user_id: sub.user_id,
                image_hash: result.perceptual_hash.clone(),
                method: result.method.to_string(),
                confidence: result.confidence,
                flagged: result.flagged,
                requires_review: result.requires_review,
                action_taken: "none".into(),
            })
            .await
        {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(
                    gid = sub.guild_id,
                    uid = sub.user_id,
                    flagged = result.flagged,
                    error = ?e,
                    "detection not recorded, escalation skipped"
                );
                return Ok(Some(ProcessOutcome {
                    detection_id: None,
                    result,
                    escalation: None,
                    review: None,
                    delete_message,
                }));
            }
        };

        let mut escalation = None;
        let mut review = None;

        let label = if result.flagged {
            match self
                .escalation
                .record_offense(sub.guild_id, sub.user_id, detection_id)
                .await
            {
                Ok(outcome) => {
                    let label = outcome.action_label().to_string();
                    escalation = Some(outcome);
                    label
                }
                Err(e) => {
                    tracing::error!(gid = sub.guild_id, uid = sub.user_id, detection_id, error = ?e, "escalation failed");
                    "escalation_failed".to_string()
                }
            }
        } else {
            match self
                .store
                .insert_review(&NewReview {
                    detection_id,
                    kind: ReviewKind::Detection,
                    user_id: sub.user_id,
                    guild_id: sub.guild_id,
                    sanction_id: None,
                })
                .await
            {
                Ok(item) => {
                    tracing::info!(gid = sub.guild_id, uid = sub.user_id, review_id = item.id, "detection queued for review");
                    review = Some(item);
                    "review_requested".to_string()
                }
                Err(e) => {
                    tracing::error!(gid = sub.guild_id, detection_id, error = ?e, "review item not created");
                    "review_failed".to_string()
                }
            }
        };
        let action = if delete_message {
            format!("deleted+{label}")
        } else {
            label
        };
        if let Err(e) = self.store.set_detection_action(detection_id, &action).await {
            tracing::warn!(detection_id, error = ?e, "action_taken not updated");
        }

        if let Some(item) = &review {
            self.send_review_alert(item).await;
        }
        if let Some(channel_id) = gcfg.alert_channel_id {
            let alert = DetectionAlert {
                channel_id,
                guild_id: sub.guild_id,
                user_id: sub.user_id,
                detection_id,
                method: result.method.to_string(),
                confidence: result.confidence,
                action_taken: action.clone(),
                requires_review: result.requires_review,
            };
            if let Err(e) = self.escalation.notifier().detection_alert(&alert).await {
                tracing::warn!(gid = sub.guild_id, detection_id, error = ?e, "detection alert delivery failed");
            }
        }

        tracing::info!(
            gid = sub.guild_id,
            uid = sub.user_id,
            detection_id,
            method = %result.method,
            confidence = result.confidence,
            action = %action,
            "image detection recorded"
        );

        Ok(Some(ProcessOutcome {
            detection_id: Some(detection_id),
            result,
            escalation,
            review,
            delete_message,
        }))
    }

    async fn send_review_alert(&self, item: &ReviewItem) {
        let channel = match self.escalation.review_channel(item.kind, item.guild_id).await {
            Ok(Some(c)) => c,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = ?e, "review channel lookup failed");
                return;
            }
        };
        let offense_count = match self.store.offense_record(item.user_id).await {
            Ok(r) => r.map(|r| r.offense_count).unwrap_or(0),
            Err(_) => 0,
        };
        let alert = ReviewAlert {
            channel_id: channel,
            review_id: item.id,
            detection_id: item.detection_id,
            kind: item.kind,
            guild_id: item.guild_id,
            user_id: item.user_id,
            offense_count,
        };
        if let Err(e) = self.escalation.notifier().review_alert(&alert).await {
            tracing::warn!(review_id = item.id, error = ?e, "review alert delivery failed");
        }
    }

    /// Zatwierdzenie dowolnego przeglądu.
    /// `Detection` => przewinienie potwierdzone, uruchamia eskalację.
    /// `GlobalBan` => globalny ban.
    pub async fn approve_review(&self, review_id: i64, moderator_id: u64) -> Result<ReviewResolution> {
        let review = self
            .store
            .review(review_id)
            .await?
            .ok_or(EscalationError::ReviewNotFound(review_id))?;

        match review.kind {
            ReviewKind::GlobalBan => {
                let report = self.escalation.approve(review_id, moderator_id).await?;
                Ok(match report.decision {
                    ReviewDecision::AlreadyDecided(status) => ReviewResolution::AlreadyDecided { status },
                    ReviewDecision::Applied => ReviewResolution::GlobalBan(report),
                })
            }
            ReviewKind::Detection => {
                if !self
                    .store
                    .decide_review(review_id, ReviewStatus::Approved, moderator_id)
                    .await?
                {
                    let status = self
                        .store
                        .review(review_id)
                        .await?
                        .map(|r| r.status)
                        .unwrap_or(review.status);
                    return Ok(ReviewResolution::AlreadyDecided { status });
                }
                // przewinienie liczone raz na detekcję, więc po błędzie można ponowić
                let outcome = match self
                    .escalation
                    .record_offense(review.guild_id, review.user_id, review.detection_id)
                    .await
                {
                    Ok(o) => o,
                    Err(e) => {
                        match self.store.reopen_review(review_id).await {
                            Ok(_) => tracing::warn!(review_id, error = ?e, "offense not recorded, review reopened"),
                            Err(re) => tracing::error!(review_id, error = ?e, reopen_error = ?re, "offense not recorded, review stuck as approved"),
                        }
                        return Err(e);
                    }
                };
                if let Err(e) = self
                    .store
                    .set_detection_action(review.detection_id, &format!("confirmed+{}", outcome.action_label()))
                    .await
                {
                    tracing::warn!(review_id, error = ?e, "action_taken not updated");
                }
                tracing::info!(review_id, uid = review.user_id, moderator_id, "detection confirmed by moderator");
                Ok(ReviewResolution::OffenseConfirmed(outcome))
            }
        }
    }

    pub async fn reject_review(&self, review_id: i64, moderator_id: u64) -> Result<ReviewDecision> {
        self.escalation.reject(review_id, moderator_id).await
    }
}
