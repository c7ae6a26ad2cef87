//! Magazyn w pamięci (DashMap). Używany w testach i w trybie dev bez bazy.

use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::*;

#[derive(Debug, Default)]
pub struct MemoryStore {
    next_id: AtomicI64,
    guilds: DashMap<u64, GuildConfig>,
    users: DashMap<u64, OffenseRecord>,
    // detection_id -> licznik po zaliczeniu tej detekcji
    offense_events: DashMap<i64, u32>,
    detections: DashMap<i64, DetectionRecord>,
    sanctions: DashMap<i64, SanctionRecord>,
    reviews: DashMap<i64, ReviewItem>,
    // Vec zachowuje kolejność dodania (kolejność iteracji prefiltra)
    hashes: std::sync::RwLock<Vec<KnownHash>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Wszystkie wpisy blocklisty łącznie z nieaktywnymi (audyt).
    pub fn all_hashes(&self) -> Vec<KnownHash> {
        self.hashes.read().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reviews_for_user(&self, user_id: u64) -> Vec<ReviewItem> {
        let mut out: Vec<ReviewItem> = self
            .reviews
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.clone())
            .collect();
        out.sort_by_key(|r| r.id);
        out
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn guild_config(&self, guild_id: u64) -> Result<GuildConfig> {
        Ok(self
            .guilds
            .get(&guild_id)
            .map(|c| c.clone())
            .unwrap_or_else(|| GuildConfig::default_for(guild_id)))
    }

    async fn upsert_guild_config(&self, cfg: &GuildConfig) -> Result<()> {
        self.guilds.insert(cfg.guild_id, cfg.clone());
        Ok(())
    }

    async fn offense_record(&self, user_id: u64) -> Result<Option<OffenseRecord>> {
        Ok(self.users.get(&user_id).map(|r| *r))
    }

    async fn increment_offense(&self, user_id: u64, detection_id: i64) -> Result<OffenseRecord> {
        // entry() trzyma blokadę shardu przez cały read-modify-write;
        // kolejność blokad zawsze: offense_events -> users
        match self.offense_events.entry(detection_id) {
            Entry::Occupied(counted) => {
                let globally_banned = self.users.get(&user_id).is_some_and(|u| u.globally_banned);
                Ok(OffenseRecord {
                    user_id,
                    offense_count: *counted.get(),
                    globally_banned,
                })
            }
            Entry::Vacant(slot) => {
                let mut entry = self.users.entry(user_id).or_insert(OffenseRecord {
                    user_id,
                    offense_count: 0,
                    globally_banned: false,
                });
                entry.offense_count += 1;
                slot.insert(entry.offense_count);
                Ok(*entry)
            }
        }
    }

    async fn set_globally_banned(&self, user_id: u64, banned: bool) -> Result<()> {
        let mut entry = self.users.entry(user_id).or_insert(OffenseRecord {
            user_id,
            offense_count: 0,
            globally_banned: false,
        });
        entry.globally_banned = banned;
        Ok(())
    }

    async fn insert_detection(&self, d: &NewDetection) -> Result<i64> {
        let id = self.id();
        self.detections.insert(
            id,
            DetectionRecord {
                id,
                guild_id: d.guild_id,
                channel_id: d.channel_id,
                message_id: d.message_id,
                user_id: d.user_id,
                image_hash: d.image_hash.clone(),
                method: d.method.clone(),
                confidence: d.confidence,
                flagged: d.flagged,
                requires_review: d.requires_review,
                action_taken: d.action_taken.clone(),
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn set_detection_action(&self, id: i64, action_taken: &str) -> Result<()> {
        if let Some(mut d) = self.detections.get_mut(&id) {
            d.action_taken = action_taken.to_string();
        }
        Ok(())
    }

    async fn detection(&self, id: i64) -> Result<Option<DetectionRecord>> {
        Ok(self.detections.get(&id).map(|d| d.clone()))
    }

    async fn insert_sanction(&self, s: &NewSanction) -> Result<SanctionRecord> {
        let rec = SanctionRecord {
            id: self.id(),
            user_id: s.user_id,
            guild_id: s.guild_id,
            level: s.level,
            kind: s.kind,
            active: s.active,
            expires_at: s.expires_at,
            created_at: Utc::now(),
        };
        self.sanctions.insert(rec.id, rec.clone());
        Ok(rec)
    }

    async fn sanction(&self, id: i64) -> Result<Option<SanctionRecord>> {
        Ok(self.sanctions.get(&id).map(|s| s.clone()))
    }

    async fn sanctions_for_user(&self, user_id: u64) -> Result<Vec<SanctionRecord>> {
        let mut out: Vec<SanctionRecord> = self
            .sanctions
            .iter()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.clone())
            .collect();
        out.sort_by_key(|s| s.id);
        Ok(out)
    }

    async fn insert_review(&self, r: &NewReview) -> Result<ReviewItem> {
        let item = ReviewItem {
            id: self.id(),
            detection_id: r.detection_id,
            kind: r.kind,
            user_id: r.user_id,
            guild_id: r.guild_id,
            sanction_id: r.sanction_id,
            status: ReviewStatus::Pending,
            moderator_id: None,
        };
        self.reviews.insert(item.id, item.clone());
        Ok(item)
    }

    async fn review(&self, id: i64) -> Result<Option<ReviewItem>> {
        Ok(self.reviews.get(&id).map(|r| r.clone()))
    }

    async fn decide_review(&self, id: i64, status: ReviewStatus, moderator_id: u64) -> Result<bool> {
        match self.reviews.get_mut(&id) {
            Some(mut r) if r.status == ReviewStatus::Pending => {
                r.status = status;
                r.moderator_id = Some(moderator_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn resolve_review(&self, id: i64, status: ReviewStatus, moderator_id: u64) -> Result<bool> {
        // blokada wpisu przeglądu przez całą operację = jedna "transakcja"
        let Some(mut review) = self.reviews.get_mut(&id) else {
            return Ok(false);
        };
        if review.status != ReviewStatus::Pending {
            return Ok(false);
        }
        let approved = status == ReviewStatus::Approved;

        if let Some(sid) = review.sanction_id {
            if let Some(mut s) = self.sanctions.get_mut(&sid) {
                if s.kind == SanctionKind::PendingReview {
                    s.kind = if approved {
                        SanctionKind::GlobalApproved
                    } else {
                        SanctionKind::GlobalRejected
                    };
                    s.active = approved;
                }
            }
        }
        if approved && review.kind == ReviewKind::GlobalBan {
            self.users
                .entry(review.user_id)
                .or_insert(OffenseRecord {
                    user_id: review.user_id,
                    offense_count: 0,
                    globally_banned: false,
                })
                .globally_banned = true;
        }

        review.status = status;
        review.moderator_id = Some(moderator_id);
        Ok(true)
    }

    async fn reopen_review(&self, id: i64) -> Result<bool> {
        match self.reviews.get_mut(&id) {
            Some(mut r) if r.status == ReviewStatus::Approved => {
                r.status = ReviewStatus::Pending;
                r.moderator_id = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn pending_reviews(&self) -> Result<Vec<ReviewItem>> {
        let mut out: Vec<ReviewItem> = self
            .reviews
            .iter()
            .filter(|r| r.status == ReviewStatus::Pending)
            .map(|r| r.clone())
            .collect();
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    async fn active_hashes(&self) -> Result<Vec<KnownHash>> {
        let guard = self
            .hashes
            .read()
            .map_err(|_| anyhow::anyhow!("hash list lock poisoned"))?;
        Ok(guard.iter().filter(|h| h.active).cloned().collect())
    }

    async fn add_known_hash(
        &self,
        hash: &PerceptualHash,
        severity: Severity,
        reason: Option<&str>,
        added_by: Option<u64>,
    ) -> Result<KnownHash> {
        let entry = KnownHash {
            id: self.id(),
            hash: hash.clone(),
            severity,
            active: true,
            reason: reason.map(str::to_string),
            added_by,
        };
        self.hashes
            .write()
            .map_err(|_| anyhow::anyhow!("hash list lock poisoned"))?
            .push(entry.clone());
        Ok(entry)
    }

    async fn deactivate_hash(&self, id: i64) -> Result<bool> {
        let mut guard = self
            .hashes
            .write()
            .map_err(|_| anyhow::anyhow!("hash list lock poisoned"))?;
        match guard.iter_mut().find(|h| h.id == id && h.active) {
            Some(h) => {
                h.active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn increment_is_monotonic_under_contention() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let mut tasks = Vec::new();
        for i in 0..32 {
            let s = store.clone();
            tasks.push(tokio::spawn(async move { s.increment_offense(7, i).await.unwrap().offense_count }));
        }
        let mut seen = Vec::new();
        for t in tasks {
            seen.push(t.await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=32).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn same_detection_counts_once() {
        let store = MemoryStore::new();
        assert_eq!(store.increment_offense(7, 100).await.unwrap().offense_count, 1);
        assert_eq!(store.increment_offense(7, 101).await.unwrap().offense_count, 2);
        // powtórka pierwszej detekcji oddaje jej licznik, nie podbija
        assert_eq!(store.increment_offense(7, 100).await.unwrap().offense_count, 1);
        assert_eq!(store.offense_record(7).await.unwrap().unwrap().offense_count, 2);
    }

    #[tokio::test]
    async fn resolve_review_moves_sanction_and_ban_together() {
        let store = MemoryStore::new();
        let s = store
            .insert_sanction(&NewSanction {
                user_id: 2,
                guild_id: 3,
                level: 2,
                kind: SanctionKind::PendingReview,
                active: false,
                expires_at: None,
            })
            .await
            .unwrap();
        let r = store
            .insert_review(&NewReview {
                detection_id: 1,
                kind: ReviewKind::GlobalBan,
                user_id: 2,
                guild_id: 3,
                sanction_id: Some(s.id),
            })
            .await
            .unwrap();

        assert!(store.resolve_review(r.id, ReviewStatus::Approved, 9).await.unwrap());
        assert!(!store.resolve_review(r.id, ReviewStatus::Rejected, 9).await.unwrap());

        let s = store.sanction(s.id).await.unwrap().unwrap();
        assert_eq!((s.kind, s.active), (SanctionKind::GlobalApproved, true));
        assert!(store.offense_record(2).await.unwrap().unwrap().globally_banned);
        assert!(!store.reopen_review(999).await.unwrap());
    }

    #[tokio::test]
    async fn deactivated_hash_is_kept_for_audit() {
        let store = MemoryStore::new();
        let h = PerceptualHash::from_bits(&[true; 64]);
        let k = store.add_known_hash(&h, Severity::High, Some("x"), Some(1)).await.unwrap();
        assert!(store.deactivate_hash(k.id).await.unwrap());
        assert!(!store.deactivate_hash(k.id).await.unwrap());
        assert!(store.active_hashes().await.unwrap().is_empty());
        assert_eq!(store.all_hashes().len(), 1);
    }

    #[tokio::test]
    async fn review_is_decided_once() {
        let store = MemoryStore::new();
        let r = store
            .insert_review(&NewReview {
                detection_id: 1,
                kind: ReviewKind::Detection,
                user_id: 2,
                guild_id: 3,
                sanction_id: None,
            })
            .await
            .unwrap();
        assert!(store.decide_review(r.id, ReviewStatus::Rejected, 9).await.unwrap());
        assert!(!store.decide_review(r.id, ReviewStatus::Approved, 9).await.unwrap());
        let r = store.review(r.id).await.unwrap().unwrap();
        assert_eq!(r.status, ReviewStatus::Rejected);
    }
}
