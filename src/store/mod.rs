//! Warstwa danych (kolaborator trwałego zapisu).
//!
//! Trait `Store` opisuje operacje, których potrzebuje silnik; implementacje:
//! - `PgStore` (Postgres, produkcja)
//! - `MemoryStore` (testy + tryb dev bez bazy)
//!
//! Operacje atomowe po stronie magazynu:
//! - `increment_offense` (increment-and-fetch per użytkownik, raz na detekcję),
//! - `decide_review` (zmiana tylko z oczekiwanego stanu),
//! - `resolve_review` (decyzja + sankcja + `globally_banned` jako jedna całość).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hashing::PerceptualHash;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/* ===========================
   Rekordy
   =========================== */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildConfig {
    pub guild_id: u64,
    pub detection_enabled: bool,
    pub auto_delete: bool,
    /// true => pierwsze przewinienie kończy się lokalnym banem, false => timeoutem
    pub auto_ban: bool,
    pub alert_channel_id: Option<u64>,
    pub moderator_role_ids: Vec<u64>,
}

impl GuildConfig {
    pub fn default_for(guild_id: u64) -> Self {
        Self {
            guild_id,
            detection_enabled: true,
            auto_delete: true,
            auto_ban: false,
            alert_channel_id: None,
            moderator_role_ids: Vec::new(),
        }
    }
}

/// Globalny (nie per-gildia) rekord przewinień użytkownika.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffenseRecord {
    pub user_id: u64,
    pub offense_count: u32,
    pub globally_banned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            _ => None,
        }
    }
}

/// Wpis blocklisty. Nigdy nie kasowany fizycznie – tylko `active=false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownHash {
    pub id: i64,
    pub hash: PerceptualHash,
    pub severity: Severity,
    pub active: bool,
    pub reason: Option<String>,
    pub added_by: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SanctionKind {
    LocalTimeout,
    LocalBan,
    PendingReview,
    GlobalApproved,
    GlobalRejected,
}

impl SanctionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SanctionKind::LocalTimeout => "local_timeout",
            SanctionKind::LocalBan => "local_ban",
            SanctionKind::PendingReview => "pending_review",
            SanctionKind::GlobalApproved => "global_approved",
            SanctionKind::GlobalRejected => "global_rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local_timeout" => Some(SanctionKind::LocalTimeout),
            "local_ban" => Some(SanctionKind::LocalBan),
            "pending_review" => Some(SanctionKind::PendingReview),
            "global_approved" => Some(SanctionKind::GlobalApproved),
            "global_rejected" => Some(SanctionKind::GlobalRejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanctionRecord {
    pub id: i64,
    pub user_id: u64,
    pub guild_id: u64,
    pub level: u8,
    pub kind: SanctionKind,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSanction {
    pub user_id: u64,
    pub guild_id: u64,
    pub level: u8,
    pub kind: SanctionKind,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReviewStatus::Pending),
            "approved" => Some(ReviewStatus::Approved),
            "rejected" => Some(ReviewStatus::Rejected),
            _ => None,
        }
    }
}

/// Czego dotyczy przegląd: wyniku z pasma "needs review" czy globalnego bana.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewKind {
    Detection,
    GlobalBan,
}

impl ReviewKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewKind::Detection => "detection",
            ReviewKind::GlobalBan => "global_ban",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "detection" => Some(ReviewKind::Detection),
            "global_ban" => Some(ReviewKind::GlobalBan),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub id: i64,
    pub detection_id: i64,
    pub kind: ReviewKind,
    pub user_id: u64,
    pub guild_id: u64,
    pub sanction_id: Option<i64>,
    pub status: ReviewStatus,
    pub moderator_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReview {
    pub detection_id: i64,
    pub kind: ReviewKind,
    pub user_id: u64,
    pub guild_id: u64,
    pub sanction_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub id: i64,
    pub guild_id: u64,
    pub channel_id: u64,
    pub message_id: u64,
    pub user_id: u64,
    pub image_hash: String,
    pub method: String,
    pub confidence: f64,
    pub flagged: bool,
    pub requires_review: bool,
    pub action_taken: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDetection {
    pub guild_id: u64,
    pub channel_id: u64,
    pub message_id: u64,
    pub user_id: u64,
    pub image_hash: String,
    pub method: String,
    pub confidence: f64,
    pub flagged: bool,
    pub requires_review: bool,
    pub action_taken: String,
}

/* ===========================
   Trait magazynu
   =========================== */

#[async_trait]
pub trait Store: Send + Sync {
    // --- konfiguracja gildii
    async fn guild_config(&self, guild_id: u64) -> Result<GuildConfig>;
    async fn upsert_guild_config(&self, cfg: &GuildConfig) -> Result<()>;

    // --- użytkownicy
    async fn offense_record(&self, user_id: u64) -> Result<Option<OffenseRecord>>;
    /// Atomowo: +1 do `offense_count` i zwróć rekord PO inkrementacji.
    /// Ta sama detekcja liczy się raz: powtórne wywołanie zwraca licznik
    /// zapisany przy pierwszym.
    async fn increment_offense(&self, user_id: u64, detection_id: i64) -> Result<OffenseRecord>;
    async fn set_globally_banned(&self, user_id: u64, banned: bool) -> Result<()>;

    // --- detekcje
    async fn insert_detection(&self, d: &NewDetection) -> Result<i64>;
    async fn set_detection_action(&self, id: i64, action_taken: &str) -> Result<()>;
    async fn detection(&self, id: i64) -> Result<Option<DetectionRecord>>;

    // --- sankcje
    async fn insert_sanction(&self, s: &NewSanction) -> Result<SanctionRecord>;
    async fn sanction(&self, id: i64) -> Result<Option<SanctionRecord>>;
    async fn sanctions_for_user(&self, user_id: u64) -> Result<Vec<SanctionRecord>>;

    // --- kolejka przeglądu
    async fn insert_review(&self, r: &NewReview) -> Result<ReviewItem>;
    async fn review(&self, id: i64) -> Result<Option<ReviewItem>>;
    /// pending -> approved|rejected, dokładnie raz; zwraca czy zmieniono.
    async fn decide_review(&self, id: i64, status: ReviewStatus, moderator_id: u64) -> Result<bool>;
    /// Jak `decide_review`, ale w jednej transakcji z przypiętą sankcją
    /// (`pending_review` -> `global_approved`/`global_rejected`) i, przy
    /// zatwierdzonym `GlobalBan`, z `globally_banned = true`. Albo wszystko, albo nic.
    async fn resolve_review(&self, id: i64, status: ReviewStatus, moderator_id: u64) -> Result<bool>;
    /// approved -> pending (cofnięcie przejęcia, gdy dalsze kroki się nie udały).
    async fn reopen_review(&self, id: i64) -> Result<bool>;
    async fn pending_reviews(&self) -> Result<Vec<ReviewItem>>;

    // --- blocklista hashy
    async fn active_hashes(&self) -> Result<Vec<KnownHash>>;
    async fn add_known_hash(
        &self,
        hash: &PerceptualHash,
        severity: Severity,
        reason: Option<&str>,
        added_by: Option<u64>,
    ) -> Result<KnownHash>;
    async fn deactivate_hash(&self, id: i64) -> Result<bool>;
}
