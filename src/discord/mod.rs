// src/discord/mod.rs
use std::sync::Arc;

use anyhow::Result;
use serenity::all::*;
use serenity::async_trait;

use crate::AppContext;
use crate::engine::ImageSubmission;
use crate::scanner::ImageRef;

pub mod commands;
pub mod enforcer;
pub mod notify;

use commands::ImageGuardCmd;

pub struct Handler {
    pub app: Arc<AppContext>,
}

/// Załącznik traktujemy jako obraz po content-type, a gdy go brak – po rozszerzeniu.
pub fn is_image_attachment(content_type: Option<&str>, filename: &str) -> bool {
    if let Some(ct) = content_type {
        return ct.to_ascii_lowercase().starts_with("image/");
    }
    let name = filename.to_ascii_lowercase();
    [".png", ".jpg", ".jpeg", ".gif", ".webp"]
        .iter()
        .any(|ext| name.ends_with(ext))
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!("Logged in as {}", ready.user.name);

        for g in ready.guilds {
            if let Err(e) = ImageGuardCmd::register_commands(&ctx, g.id).await {
                tracing::warn!(error=?e, gid=%g.id.get(), "register imageguard failed");
            }
        }
    }

    async fn guild_create(&self, ctx: Context, guild: Guild, _is_new: Option<bool>) {
        if let Err(e) = ImageGuardCmd::register_commands(&ctx, guild.id).await {
            tracing::warn!(error=?e, gid=%guild.id.get(), "register imageguard failed (on guild_create)");
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        ImageGuardCmd::on_interaction(&ctx, &self.app, interaction).await;
    }

    async fn message(&self, ctx: Context, msg: Message) {
        let Some(gid) = msg.guild_id else {
            return;
        };
        if msg.author.bot {
            return;
        }

        for att in msg
            .attachments
            .iter()
            .filter(|a| is_image_attachment(a.content_type.as_deref(), &a.filename))
        {
            let sub = ImageSubmission {
                guild_id: gid.get(),
                channel_id: msg.channel_id.get(),
                message_id: msg.id.get(),
                user_id: msg.author.id.get(),
                image: ImageRef::Url(att.url.clone()),
                declared_size: Some(att.size as u64),
            };
            match self.app.engine.process_image(sub).await {
                // detekcja wyłączona w tej gildii
                Ok(None) => return,
                Ok(Some(out)) => {
                    if out.delete_message {
                        if let Err(e) = msg.delete(&ctx.http).await {
                            tracing::warn!(error=?e, gid=%gid.get(), "delete flagged message failed");
                        }
                    }
                    if out.result.flagged {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error=?e, gid=%gid.get(), uid=%msg.author.id.get(), "image scan failed, no action");
                }
            }
        }
    }

    async fn guild_member_addition(&self, _ctx: Context, member: Member) {
        let gid = member.guild_id.get();
        let uid = member.user.id.get();
        if let Err(e) = self.app.engine.escalation().enforce_on_join(gid, uid).await {
            tracing::warn!(error=?e, gid, uid, "join enforcement failed");
        }
    }
}

fn intents_from_settings(names: &[String]) -> GatewayIntents {
    let mut i = GatewayIntents::empty();
    for n in names {
        match n.as_str() {
            "GUILDS" => i |= GatewayIntents::GUILDS,
            "GUILD_MEMBERS" => i |= GatewayIntents::GUILD_MEMBERS,
            "GUILD_MESSAGES" => i |= GatewayIntents::GUILD_MESSAGES,
            "MESSAGE_CONTENT" => i |= GatewayIntents::MESSAGE_CONTENT,
            _ => {}
        }
    }
    i
}

pub async fn run_bot(ctx: Arc<AppContext>) -> Result<()> {
    let token = &ctx.settings.discord.token;
    if token.is_empty() {
        anyhow::bail!("Brak tokenu Discord (TSS_DISCORD__TOKEN). Uzupełnij w .env.");
    }

    let mut intents = intents_from_settings(&ctx.settings.discord.intents);
    if intents.is_empty() {
        intents = crate::default_gateway_intents();
    }
    let handler = Handler { app: ctx.clone() };

    let mut client = serenity::Client::builder(token, intents)
        .event_handler(handler)
        .await?;

    tracing::info!("Discord client starting…");
    client.start().await?;
    Ok(())
}
