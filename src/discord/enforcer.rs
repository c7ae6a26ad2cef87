//! Egzekucja sankcji przez REST Discorda (niezależnie od klienta gateway).

use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serenity::all::{EditMember, GuildId, GuildPagination, Http, Timestamp, UserId};

use crate::escalation::Enforcer;

/// Discord nie przyjmuje timeoutów dłuższych niż 28 dni.
const MAX_TIMEOUT_DAYS: i64 = 28;
const GUILD_PAGE: u64 = 200;

pub struct SerenityEnforcer {
    http: Arc<Http>,
}

impl SerenityEnforcer {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

fn audit_reason(reason: &str) -> String {
    // limit audit-logu: 512 znaków
    reason.chars().take(512).collect()
}

#[async_trait]
impl Enforcer for SerenityEnforcer {
    async fn ban(&self, guild_id: u64, user_id: u64, reason: &str) -> Result<()> {
        GuildId::new(guild_id)
            .ban_with_reason(&self.http, UserId::new(user_id), 0, audit_reason(reason))
            .await
            .with_context(|| format!("ban uid={user_id} in gid={guild_id}"))?;
        Ok(())
    }

    async fn timeout(&self, guild_id: u64, user_id: u64, until: DateTime<Utc>, reason: &str) -> Result<()> {
        let max = Utc::now() + ChronoDuration::days(MAX_TIMEOUT_DAYS);
        let until = until.min(max);
        let ts = Timestamp::from_unix_timestamp(until.timestamp()).context("timeout timestamp")?;
        GuildId::new(guild_id)
            .edit_member(
                &self.http,
                UserId::new(user_id),
                EditMember::new()
                    .disable_communication_until_datetime(ts)
                    .audit_log_reason(&audit_reason(reason)),
            )
            .await
            .with_context(|| format!("timeout uid={user_id} in gid={guild_id}"))?;
        Ok(())
    }

    async fn guilds(&self) -> Result<Vec<u64>> {
        let mut out = Vec::new();
        let mut after: Option<GuildId> = None;
        loop {
            let page = self
                .http
                .get_guilds(after.map(GuildPagination::After), Some(GUILD_PAGE))
                .await
                .context("get_guilds")?;
            let n = page.len() as u64;
            after = page.last().map(|g| g.id);
            out.extend(page.into_iter().map(|g| g.id.get()));
            if n < GUILD_PAGE || after.is_none() {
                break;
            }
        }
        Ok(out)
    }
}
