//! Maszyna eskalacji przewinień (globalna, per użytkownik).
//!
//! Clean(0) -> Offender(1): lokalna sankcja w gildii źródłowej (ban albo timeout).
//! Offender(n>=2): sankcja `pending_review` + pozycja w kolejce przeglądu.
//! Zatwierdzenie: `global_approved`, `globally_banned=true`, ban we wszystkich gildiach.
//! Odrzucenie: `global_rejected`, licznik przewinień bez zmian.
//! GloballyBanned jest stanem końcowym: kolejne przewinienia tylko podbijają licznik.
//!
//! Rozgałęzienie liczymy z wartości zwróconej przez atomowe `increment_offense`,
//! więc dwa równoległe przewinienia tego samego użytkownika dostają 1 i 2.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::{StreamExt, stream};
use serde::Serialize;

use crate::config::EscalationConfig;
use crate::error::EscalationError;
use crate::store::{
    NewReview, NewSanction, ReviewItem, ReviewKind, ReviewStatus, SanctionKind, SanctionRecord, Store,
};

/* ===========================
   Kolaboratorzy: egzekucja i powiadomienia
   =========================== */

#[async_trait]
pub trait Enforcer: Send + Sync {
    async fn ban(&self, guild_id: u64, user_id: u64, reason: &str) -> Result<()>;
    async fn timeout(&self, guild_id: u64, user_id: u64, until: DateTime<Utc>, reason: &str) -> Result<()>;
    /// Wszystkie gildie obsługiwane przez bota.
    async fn guilds(&self) -> Result<Vec<u64>>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionAlert {
    pub channel_id: u64,
    pub guild_id: u64,
    pub user_id: u64,
    pub detection_id: i64,
    pub method: String,
    pub confidence: f64,
    pub action_taken: String,
    pub requires_review: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewAlert {
    pub channel_id: u64,
    pub review_id: i64,
    pub detection_id: i64,
    pub kind: ReviewKind,
    pub guild_id: u64,
    pub user_id: u64,
    pub offense_count: u32,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn detection_alert(&self, alert: &DetectionAlert) -> Result<()>;
    async fn review_alert(&self, alert: &ReviewAlert) -> Result<()>;
}

/* ===========================
   Raporty
   =========================== */

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetOutcome {
    pub guild_id: u64,
    pub error: Option<String>,
}

/// Wynik operacji "best effort" na wielu gildiach.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub outcomes: Vec<TargetOutcome>,
}

impl BatchReport {
    pub fn succeeded(&self) -> impl Iterator<Item = u64> + '_ {
        self.outcomes.iter().filter(|o| o.error.is_none()).map(|o| o.guild_id)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TargetOutcome> + '_ {
        self.outcomes.iter().filter(|o| o.error.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EscalationOutcome {
    LocalSanction {
        offense_count: u32,
        sanction: SanctionRecord,
        enforced: bool,
    },
    PendingReview {
        offense_count: u32,
        sanction: SanctionRecord,
        review: ReviewItem,
    },
    AlreadyBanned {
        offense_count: u32,
        enforced: bool,
    },
}

impl EscalationOutcome {
    pub fn offense_count(&self) -> u32 {
        match self {
            Self::LocalSanction { offense_count, .. }
            | Self::PendingReview { offense_count, .. }
            | Self::AlreadyBanned { offense_count, .. } => *offense_count,
        }
    }

    /// Krótki opis do `action_taken`.
    pub fn action_label(&self) -> &'static str {
        match self {
            Self::LocalSanction { sanction, .. } => sanction.kind.as_str(),
            Self::PendingReview { .. } => "pending_review",
            Self::AlreadyBanned { .. } => "globally_banned",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "status", rename_all = "snake_case")]
pub enum ReviewDecision {
    Applied,
    AlreadyDecided(ReviewStatus),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalReport {
    pub review: ReviewItem,
    pub decision: ReviewDecision,
    pub fanout: BatchReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinOutcome {
    Clean,
    Banned,
    BanFailed(String),
}

/* ===========================
   Silnik
   =========================== */

pub struct EscalationEngine {
    store: Arc<dyn Store>,
    enforcer: Arc<dyn Enforcer>,
    notifier: Arc<dyn Notifier>,
    cfg: EscalationConfig,
}

impl EscalationEngine {
    pub fn new(
        store: Arc<dyn Store>,
        enforcer: Arc<dyn Enforcer>,
        notifier: Arc<dyn Notifier>,
        cfg: EscalationConfig,
    ) -> Self {
        Self {
            store,
            enforcer,
            notifier,
            cfg,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    /// Kanał dla alertów przeglądu.
    /// `GlobalBan`: wyłącznie globalny kanał moderacji (brak => `None`).
    /// `Detection`: globalny, a gdy nie ustawiony – kanał alertów gildii.
    pub async fn review_channel(&self, kind: ReviewKind, guild_id: u64) -> Result<Option<u64>> {
        if self.cfg.review_channel_id != 0 {
            return Ok(Some(self.cfg.review_channel_id));
        }
        match kind {
            ReviewKind::GlobalBan => Ok(None),
            ReviewKind::Detection => Ok(self.store.guild_config(guild_id).await?.alert_channel_id),
        }
    }

    /// Czy decyzję o przeglądzie wolno podjąć z kanału `channel_id`.
    /// Globalny ban tylko z globalnego kanału moderacji.
    pub fn may_decide_in(&self, kind: ReviewKind, channel_id: u64) -> bool {
        match kind {
            ReviewKind::GlobalBan => self.cfg.review_channel_id != 0 && channel_id == self.cfg.review_channel_id,
            ReviewKind::Detection => true,
        }
    }

    /// Potwierdzone przewinienie (`flagged=true`) użytkownika w gildii.
    pub async fn record_offense(&self, guild_id: u64, user_id: u64, detection_id: i64) -> Result<EscalationOutcome> {
        let rec = self.store.increment_offense(user_id, detection_id).await?;
        let count = rec.offense_count;

        if rec.globally_banned {
            // stan końcowy: tylko ponowna egzekucja w tej gildii
            let enforced = self.try_ban(guild_id, user_id).await;
            tracing::info!(gid = guild_id, uid = user_id, count, enforced, "offense by globally banned user");
            return Ok(EscalationOutcome::AlreadyBanned {
                offense_count: count,
                enforced,
            });
        }

        if count <= 1 {
            return self.local_sanction(guild_id, user_id, count).await;
        }

        let sanction = self
            .store
            .insert_sanction(&NewSanction {
                user_id,
                guild_id,
                level: 2,
                kind: SanctionKind::PendingReview,
                active: false,
                expires_at: None,
            })
            .await?;
        let review = self
            .store
            .insert_review(&NewReview {
                detection_id,
                kind: ReviewKind::GlobalBan,
                user_id,
                guild_id,
                sanction_id: Some(sanction.id),
            })
            .await?;
        tracing::info!(
            gid = guild_id,
            uid = user_id,
            count,
            review_id = review.id,
            "repeat offense, global ban review opened"
        );

        self.send_review_alert(&review, count).await;

        Ok(EscalationOutcome::PendingReview {
            offense_count: count,
            sanction,
            review,
        })
    }

    async fn local_sanction(&self, guild_id: u64, user_id: u64, count: u32) -> Result<EscalationOutcome> {
        let gcfg = self.store.guild_config(guild_id).await?;
        let (kind, expires_at) = if gcfg.auto_ban {
            (SanctionKind::LocalBan, None)
        } else {
            (
                SanctionKind::LocalTimeout,
                Some(Utc::now() + ChronoDuration::hours(self.sanction_hours())),
            )
        };

        let sanction = self
            .store
            .insert_sanction(&NewSanction {
                user_id,
                guild_id,
                level: 1,
                kind,
                active: true,
                expires_at,
            })
            .await?;

        // zapis sankcji nie jest cofany, gdy egzekucja się nie uda
        let res = match (kind, expires_at) {
            (SanctionKind::LocalTimeout, Some(until)) => {
                self.enforcer
                    .timeout(guild_id, user_id, until, &self.cfg.ban_reason)
                    .await
            }
            _ => self.enforcer.ban(guild_id, user_id, &self.cfg.ban_reason).await,
        };
        let enforced = match res {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(gid = guild_id, uid = user_id, error = ?e, "local sanction enforcement failed");
                false
            }
        };
        tracing::info!(
            gid = guild_id,
            uid = user_id,
            count,
            kind = kind.as_str(),
            enforced,
            "first offense, local sanction"
        );

        Ok(EscalationOutcome::LocalSanction {
            offense_count: count,
            sanction,
            enforced,
        })
    }

    fn sanction_hours(&self) -> i64 {
        self.cfg
            .local_sanction_hours
            .clamp(1, EscalationConfig::MAX_SANCTION_HOURS)
    }

    async fn send_review_alert(&self, review: &ReviewItem, offense_count: u32) {
        let channel = match self.review_channel(review.kind, review.guild_id).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                tracing::warn!(
                    gid = review.guild_id,
                    review_id = review.id,
                    "no global review channel configured, review stays pending"
                );
                return;
            }
            Err(e) => {
                tracing::warn!(error = ?e, "review channel lookup failed");
                return;
            }
        };
        let alert = ReviewAlert {
            channel_id: channel,
            review_id: review.id,
            detection_id: review.detection_id,
            kind: review.kind,
            guild_id: review.guild_id,
            user_id: review.user_id,
            offense_count,
        };
        if let Err(e) = self.notifier.review_alert(&alert).await {
            tracing::warn!(review_id = review.id, error = ?e, "review alert delivery failed");
        }
    }

    /// Zatwierdzenie globalnego bana. Sukces zależy tylko od zmiany stanu,
    /// nie od wyników banów w poszczególnych gildiach.
    pub async fn approve(&self, review_id: i64, moderator_id: u64) -> Result<ApprovalReport> {
        let review = self
            .store
            .review(review_id)
            .await?
            .ok_or(EscalationError::ReviewNotFound(review_id))?;
        if review.kind != ReviewKind::GlobalBan {
            return Err(EscalationError::UnexpectedKind(review_id).into());
        }
        if review.sanction_id.is_none() {
            return Err(EscalationError::SanctionMissing(review_id).into());
        }

        // decyzja + sankcja + globally_banned w jednej transakcji magazynu
        if !self
            .store
            .resolve_review(review_id, ReviewStatus::Approved, moderator_id)
            .await?
        {
            return self.already_decided(review_id).await.map(|review| ApprovalReport {
                decision: ReviewDecision::AlreadyDecided(review.status),
                review,
                fanout: BatchReport::default(),
            });
        }

        tracing::info!(review_id, uid = review.user_id, moderator_id, "global ban approved");

        let fanout = self.ban_everywhere(review.guild_id, review.user_id).await;
        for f in fanout.failed() {
            tracing::warn!(
                gid = f.guild_id,
                uid = review.user_id,
                error = f.error.as_deref().unwrap_or_default(),
                "global ban failed in guild"
            );
        }

        let review = self.store.review(review_id).await?.unwrap_or(review);
        Ok(ApprovalReport {
            review,
            decision: ReviewDecision::Applied,
            fanout,
        })
    }

    /// Odrzucenie (dowolny rodzaj przeglądu). Idempotentne; licznik przewinień bez zmian.
    pub async fn reject(&self, review_id: i64, moderator_id: u64) -> Result<ReviewDecision> {
        let review = self
            .store
            .review(review_id)
            .await?
            .ok_or(EscalationError::ReviewNotFound(review_id))?;

        if !self
            .store
            .resolve_review(review_id, ReviewStatus::Rejected, moderator_id)
            .await?
        {
            let current = self.already_decided(review_id).await?;
            return Ok(ReviewDecision::AlreadyDecided(current.status));
        }

        tracing::info!(review_id, uid = review.user_id, moderator_id, kind = review.kind.as_str(), "review rejected");
        Ok(ReviewDecision::Applied)
    }

    async fn already_decided(&self, review_id: i64) -> Result<ReviewItem> {
        let current = self
            .store
            .review(review_id)
            .await?
            .ok_or(EscalationError::ReviewNotFound(review_id))?;
        tracing::debug!(review_id, status = current.status.as_str(), "review already decided");
        Ok(current)
    }

    /// Dołączenie do gildii: użytkownik z globalnym banem dostaje bana od razu.
    pub async fn enforce_on_join(&self, guild_id: u64, user_id: u64) -> Result<JoinOutcome> {
        let banned = self
            .store
            .offense_record(user_id)
            .await?
            .is_some_and(|r| r.globally_banned);
        if !banned {
            return Ok(JoinOutcome::Clean);
        }
        match self.enforcer.ban(guild_id, user_id, &self.cfg.ban_reason).await {
            Ok(()) => {
                tracing::info!(gid = guild_id, uid = user_id, "globally banned user joined, banned");
                Ok(JoinOutcome::Banned)
            }
            Err(e) => {
                tracing::warn!(gid = guild_id, uid = user_id, error = ?e, "join-time ban failed");
                Ok(JoinOutcome::BanFailed(format!("{e:#}")))
            }
        }
    }

    async fn try_ban(&self, guild_id: u64, user_id: u64) -> bool {
        match self.enforcer.ban(guild_id, user_id, &self.cfg.ban_reason).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(gid = guild_id, uid = user_id, error = ?e, "ban failed");
                false
            }
        }
    }

    /// Ban we wszystkich gildiach, najwyżej `fanout_concurrency` naraz;
    /// błąd jednej nie przerywa pozostałych.
    async fn ban_everywhere(&self, origin_guild: u64, user_id: u64) -> BatchReport {
        let guilds = match self.enforcer.guilds().await {
            Ok(g) => g,
            Err(e) => {
                tracing::warn!(error = ?e, "guild listing failed, banning in origin guild only");
                vec![origin_guild]
            }
        };

        let reason = self.cfg.ban_reason.as_str();
        let outcomes = stream::iter(guilds)
            .map(|gid| async move {
                TargetOutcome {
                    guild_id: gid,
                    error: self
                        .enforcer
                        .ban(gid, user_id, reason)
                        .await
                        .err()
                        .map(|e| format!("{e:#}")),
                }
            })
            .buffer_unordered(self.cfg.fanout_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        BatchReport { outcomes }
    }
}
