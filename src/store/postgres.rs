//! Magazyn Postgres (schemat `tss`, tabele `ig_*`, patrz migrations/).

use anyhow::{Context as _, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, postgres::PgRow};

use super::*;
use crate::db::Db;

#[derive(Debug, Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &Db {
        &self.db
    }
}

fn sanction_from_row(r: &PgRow) -> Result<SanctionRecord> {
    let kind: String = r.try_get("kind")?;
    Ok(SanctionRecord {
        id: r.try_get("id")?,
        user_id: r.try_get::<i64, _>("user_id")? as u64,
        guild_id: r.try_get::<i64, _>("guild_id")? as u64,
        level: r.try_get::<i16, _>("level")? as u8,
        kind: SanctionKind::parse(&kind).ok_or_else(|| anyhow!("unknown sanction kind {kind}"))?,
        active: r.try_get("active")?,
        expires_at: r.try_get::<Option<DateTime<Utc>>, _>("expires_at")?,
        created_at: r.try_get("created_at")?,
    })
}

fn review_from_row(r: &PgRow) -> Result<ReviewItem> {
    let kind: String = r.try_get("kind")?;
    let status: String = r.try_get("status")?;
    Ok(ReviewItem {
        id: r.try_get("id")?,
        detection_id: r.try_get("detection_id")?,
        kind: ReviewKind::parse(&kind).ok_or_else(|| anyhow!("unknown review kind {kind}"))?,
        user_id: r.try_get::<i64, _>("user_id")? as u64,
        guild_id: r.try_get::<i64, _>("guild_id")? as u64,
        sanction_id: r.try_get("sanction_id")?,
        status: ReviewStatus::parse(&status).ok_or_else(|| anyhow!("unknown review status {status}"))?,
        moderator_id: r.try_get::<Option<i64>, _>("moderator_id")?.map(|v| v as u64),
    })
}

fn hash_from_row(r: &PgRow) -> Result<KnownHash> {
    let hex: String = r.try_get("hash")?;
    let severity: String = r.try_get("severity")?;
    Ok(KnownHash {
        id: r.try_get("id")?,
        hash: PerceptualHash::from_hex(&hex)?,
        severity: Severity::parse(&severity).ok_or_else(|| anyhow!("unknown severity {severity}"))?,
        active: r.try_get("active")?,
        reason: r.try_get("reason")?,
        added_by: r.try_get::<Option<i64>, _>("added_by")?.map(|v| v as u64),
    })
}

const SANCTION_COLS: &str = "id, user_id, guild_id, level, kind, active, expires_at, created_at";
const REVIEW_COLS: &str =
    "id, detection_id, kind, user_id, guild_id, sanction_id, status, moderator_id";

#[async_trait]
impl Store for PgStore {
    async fn guild_config(&self, guild_id: u64) -> Result<GuildConfig> {
        let row = sqlx::query(
            r#"SELECT detection_enabled, auto_delete, auto_ban, alert_channel_id, moderator_role_ids
               FROM tss.ig_guild_config WHERE guild_id = $1"#,
        )
        .bind(guild_id as i64)
        .fetch_optional(&self.db)
        .await?;

        let Some(r) = row else {
            return Ok(GuildConfig::default_for(guild_id));
        };
        let roles: Vec<i64> = r.try_get("moderator_role_ids")?;
        Ok(GuildConfig {
            guild_id,
            detection_enabled: r.try_get("detection_enabled")?,
            auto_delete: r.try_get("auto_delete")?,
            auto_ban: r.try_get("auto_ban")?,
            alert_channel_id: r.try_get::<Option<i64>, _>("alert_channel_id")?.map(|v| v as u64),
            moderator_role_ids: roles.into_iter().map(|v| v as u64).collect(),
        })
    }

    async fn upsert_guild_config(&self, cfg: &GuildConfig) -> Result<()> {
        let roles: Vec<i64> = cfg.moderator_role_ids.iter().map(|v| *v as i64).collect();
        sqlx::query(
            r#"INSERT INTO tss.ig_guild_config
                 (guild_id, detection_enabled, auto_delete, auto_ban, alert_channel_id, moderator_role_ids)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (guild_id) DO UPDATE SET
                 detection_enabled  = EXCLUDED.detection_enabled,
                 auto_delete        = EXCLUDED.auto_delete,
                 auto_ban           = EXCLUDED.auto_ban,
                 alert_channel_id   = EXCLUDED.alert_channel_id,
                 moderator_role_ids = EXCLUDED.moderator_role_ids,
                 updated_at         = now()"#,
        )
        .bind(cfg.guild_id as i64)
        .bind(cfg.detection_enabled)
        .bind(cfg.auto_delete)
        .bind(cfg.auto_ban)
        .bind(cfg.alert_channel_id.map(|v| v as i64))
        .bind(roles)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn offense_record(&self, user_id: u64) -> Result<Option<OffenseRecord>> {
        let row = sqlx::query(
            "SELECT offense_count, globally_banned FROM tss.ig_users WHERE user_id = $1",
        )
        .bind(user_id as i64)
        .fetch_optional(&self.db)
        .await?;
        row.map(|r| {
            Ok(OffenseRecord {
                user_id,
                offense_count: r.try_get::<i32, _>("offense_count")? as u32,
                globally_banned: r.try_get("globally_banned")?,
            })
        })
        .transpose()
    }

    async fn increment_offense(&self, user_id: u64, detection_id: i64) -> Result<OffenseRecord> {
        let mut tx = self.db.begin().await?;

        // Zajęcie detekcji; konkurencyjny INSERT tej samej detekcji czeka na nasz COMMIT.
        let claimed = sqlx::query(
            r#"INSERT INTO tss.ig_offense_events (detection_id, user_id, offense_count)
               VALUES ($1, $2, 0)
               ON CONFLICT (detection_id) DO NOTHING"#,
        )
        .bind(detection_id)
        .bind(user_id as i64)
        .execute(&mut *tx)
        .await
        .context("claim offense event")?
        .rows_affected()
            > 0;

        if !claimed {
            let r = sqlx::query(
                r#"SELECT e.offense_count, COALESCE(u.globally_banned, FALSE) AS globally_banned
                   FROM tss.ig_offense_events e
                   LEFT JOIN tss.ig_users u ON u.user_id = e.user_id
                   WHERE e.detection_id = $1"#,
            )
            .bind(detection_id)
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(OffenseRecord {
                user_id,
                offense_count: r.try_get::<i32, _>("offense_count")? as u32,
                globally_banned: r.try_get("globally_banned")?,
            });
        }

        // Jedno polecenie = atomowy increment-and-fetch (blokada wiersza w Postgresie).
        let r = sqlx::query(
            r#"INSERT INTO tss.ig_users (user_id, offense_count)
               VALUES ($1, 1)
               ON CONFLICT (user_id) DO UPDATE
                 SET offense_count = tss.ig_users.offense_count + 1,
                     updated_at    = now()
               RETURNING offense_count, globally_banned"#,
        )
        .bind(user_id as i64)
        .fetch_one(&mut *tx)
        .await
        .context("increment_offense")?;
        let rec = OffenseRecord {
            user_id,
            offense_count: r.try_get::<i32, _>("offense_count")? as u32,
            globally_banned: r.try_get("globally_banned")?,
        };

        sqlx::query("UPDATE tss.ig_offense_events SET offense_count = $2 WHERE detection_id = $1")
            .bind(detection_id)
            .bind(rec.offense_count as i32)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(rec)
    }

    async fn set_globally_banned(&self, user_id: u64, banned: bool) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO tss.ig_users (user_id, globally_banned)
               VALUES ($1, $2)
               ON CONFLICT (user_id) DO UPDATE
                 SET globally_banned = EXCLUDED.globally_banned, updated_at = now()"#,
        )
        .bind(user_id as i64)
        .bind(banned)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn insert_detection(&self, d: &NewDetection) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"INSERT INTO tss.ig_detections
                 (guild_id, channel_id, message_id, user_id, image_hash, method,
                  confidence, flagged, requires_review, action_taken)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
               RETURNING id"#,
        )
        .bind(d.guild_id as i64)
        .bind(d.channel_id as i64)
        .bind(d.message_id as i64)
        .bind(d.user_id as i64)
        .bind(&d.image_hash)
        .bind(&d.method)
        .bind(d.confidence)
        .bind(d.flagged)
        .bind(d.requires_review)
        .bind(&d.action_taken)
        .fetch_one(&self.db)
        .await?;
        Ok(id)
    }

    async fn set_detection_action(&self, id: i64, action_taken: &str) -> Result<()> {
        sqlx::query("UPDATE tss.ig_detections SET action_taken = $2 WHERE id = $1")
            .bind(id)
            .bind(action_taken)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn detection(&self, id: i64) -> Result<Option<DetectionRecord>> {
        let row = sqlx::query(
            r#"SELECT id, guild_id, channel_id, message_id, user_id, image_hash, method,
                      confidence, flagged, requires_review, action_taken, created_at
               FROM tss.ig_detections WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        row.map(|r| {
            Ok(DetectionRecord {
                id: r.try_get("id")?,
                guild_id: r.try_get::<i64, _>("guild_id")? as u64,
                channel_id: r.try_get::<i64, _>("channel_id")? as u64,
                message_id: r.try_get::<i64, _>("message_id")? as u64,
                user_id: r.try_get::<i64, _>("user_id")? as u64,
                image_hash: r.try_get("image_hash")?,
                method: r.try_get("method")?,
                confidence: r.try_get("confidence")?,
                flagged: r.try_get("flagged")?,
                requires_review: r.try_get("requires_review")?,
                action_taken: r.try_get("action_taken")?,
                created_at: r.try_get("created_at")?,
            })
        })
        .transpose()
    }

    async fn insert_sanction(&self, s: &NewSanction) -> Result<SanctionRecord> {
        let sql = format!(
            "INSERT INTO tss.ig_sanctions (user_id, guild_id, level, kind, active, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {SANCTION_COLS}"
        );
        let r = sqlx::query(&sql)
            .bind(s.user_id as i64)
            .bind(s.guild_id as i64)
            .bind(s.level as i16)
            .bind(s.kind.as_str())
            .bind(s.active)
            .bind(s.expires_at)
            .fetch_one(&self.db)
            .await?;
        sanction_from_row(&r)
    }

    async fn sanction(&self, id: i64) -> Result<Option<SanctionRecord>> {
        let sql = format!("SELECT {SANCTION_COLS} FROM tss.ig_sanctions WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.db).await?;
        row.as_ref().map(sanction_from_row).transpose()
    }

    async fn sanctions_for_user(&self, user_id: u64) -> Result<Vec<SanctionRecord>> {
        let sql = format!("SELECT {SANCTION_COLS} FROM tss.ig_sanctions WHERE user_id = $1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(user_id as i64)
            .fetch_all(&self.db)
            .await?;
        rows.iter().map(sanction_from_row).collect()
    }

    async fn insert_review(&self, r: &NewReview) -> Result<ReviewItem> {
        let sql = format!(
            "INSERT INTO tss.ig_reviews (detection_id, kind, user_id, guild_id, sanction_id)
             VALUES ($1, $2, $3, $4, $5) RETURNING {REVIEW_COLS}"
        );
        let row = sqlx::query(&sql)
            .bind(r.detection_id)
            .bind(r.kind.as_str())
            .bind(r.user_id as i64)
            .bind(r.guild_id as i64)
            .bind(r.sanction_id)
            .fetch_one(&self.db)
            .await?;
        review_from_row(&row)
    }

    async fn review(&self, id: i64) -> Result<Option<ReviewItem>> {
        let sql = format!("SELECT {REVIEW_COLS} FROM tss.ig_reviews WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.db).await?;
        row.as_ref().map(review_from_row).transpose()
    }

    async fn decide_review(&self, id: i64, status: ReviewStatus, moderator_id: u64) -> Result<bool> {
        let res = sqlx::query(
            r#"UPDATE tss.ig_reviews
               SET status = $2, moderator_id = $3, decided_at = now()
               WHERE id = $1 AND status = 'pending'"#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(moderator_id as i64)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn resolve_review(&self, id: i64, status: ReviewStatus, moderator_id: u64) -> Result<bool> {
        let approved = status == ReviewStatus::Approved;
        let mut tx = self.db.begin().await?;

        let row = sqlx::query(
            r#"UPDATE tss.ig_reviews
               SET status = $2, moderator_id = $3, decided_at = now()
               WHERE id = $1 AND status = 'pending'
               RETURNING kind, user_id, sanction_id"#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(moderator_id as i64)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(false);
        };
        let kind: String = row.try_get("kind")?;
        let user_id: i64 = row.try_get("user_id")?;
        let sanction_id: Option<i64> = row.try_get("sanction_id")?;

        if let Some(sid) = sanction_id {
            let to = if approved {
                SanctionKind::GlobalApproved
            } else {
                SanctionKind::GlobalRejected
            };
            sqlx::query(
                r#"UPDATE tss.ig_sanctions
                   SET kind = $2, active = $3, updated_at = now()
                   WHERE id = $1 AND kind = 'pending_review'"#,
            )
            .bind(sid)
            .bind(to.as_str())
            .bind(approved)
            .execute(&mut *tx)
            .await?;
        }

        if approved && kind == ReviewKind::GlobalBan.as_str() {
            sqlx::query(
                r#"INSERT INTO tss.ig_users (user_id, globally_banned)
                   VALUES ($1, TRUE)
                   ON CONFLICT (user_id) DO UPDATE
                     SET globally_banned = TRUE, updated_at = now()"#,
            )
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.context("resolve_review commit")?;
        Ok(true)
    }

    async fn reopen_review(&self, id: i64) -> Result<bool> {
        let res = sqlx::query(
            r#"UPDATE tss.ig_reviews
               SET status = 'pending', moderator_id = NULL, decided_at = NULL
               WHERE id = $1 AND status = 'approved'"#,
        )
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn pending_reviews(&self) -> Result<Vec<ReviewItem>> {
        let sql = format!(
            "SELECT {REVIEW_COLS} FROM tss.ig_reviews WHERE status = 'pending' ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.db).await?;
        rows.iter().map(review_from_row).collect()
    }

    async fn active_hashes(&self) -> Result<Vec<KnownHash>> {
        // ORDER BY id => stabilna kolejność iteracji prefiltra ("pierwszy wygrywa")
        let rows = sqlx::query(
            r#"SELECT id, hash, severity, active, reason, added_by
               FROM tss.ig_hash_database WHERE active ORDER BY id"#,
        )
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(hash_from_row).collect()
    }

    async fn add_known_hash(
        &self,
        hash: &PerceptualHash,
        severity: Severity,
        reason: Option<&str>,
        added_by: Option<u64>,
    ) -> Result<KnownHash> {
        let row = sqlx::query(
            r#"INSERT INTO tss.ig_hash_database (hash, severity, reason, added_by)
               VALUES ($1, $2, $3, $4)
               RETURNING id, hash, severity, active, reason, added_by"#,
        )
        .bind(hash.to_hex())
        .bind(severity.as_str())
        .bind(reason)
        .bind(added_by.map(|v| v as i64))
        .fetch_one(&self.db)
        .await?;
        hash_from_row(&row)
    }

    async fn deactivate_hash(&self, id: i64) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE tss.ig_hash_database SET active = FALSE WHERE id = $1 AND active",
        )
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }
}
