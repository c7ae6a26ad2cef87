//! `/imageguard` + przyciski przeglądu `igr:{id}:approve|reject`.

use std::sync::Arc;

use anyhow::Result;
use serenity::all::{
    CommandInteraction, CommandOptionType, ComponentInteraction, Context, CreateCommand,
    CreateCommandOption, CreateInteractionResponse, CreateInteractionResponseMessage,
    EditInteractionResponse, GuildId, Interaction, Member, Permissions, ResolvedOption, ResolvedValue,
};

use crate::AppContext;
use crate::engine::ReviewResolution;
use crate::escalation::{EscalationOutcome, ReviewDecision};
use crate::store::{GuildConfig, Severity};

pub struct ImageGuardCmd;

/// Moderator = rola z konfiguracji gildii albo BAN_MEMBERS / ADMINISTRATOR.
pub fn is_moderator(role_ids: &[u64], perms: Option<Permissions>, cfg: &GuildConfig) -> bool {
    if perms.is_some_and(|p| p.administrator() || p.ban_members()) {
        return true;
    }
    role_ids.iter().any(|r| cfg.moderator_role_ids.contains(r))
}

fn member_is_moderator(member: Option<&Member>, cfg: &GuildConfig) -> bool {
    let Some(m) = member else {
        return false;
    };
    let roles: Vec<u64> = m.roles.iter().map(|r| r.get()).collect();
    is_moderator(&roles, m.permissions, cfg)
}

/// `igr:12:approve` -> (12, "approve")
pub fn parse_review_button(custom_id: &str) -> Option<(i64, &str)> {
    let mut parts = custom_id.split(':');
    if parts.next()? != "igr" {
        return None;
    }
    let id = parts.next()?.parse().ok()?;
    let action = parts.next()?;
    if parts.next().is_some() || !matches!(action, "approve" | "reject") {
        return None;
    }
    Some((id, action))
}

impl ImageGuardCmd {
    pub async fn register_commands(ctx: &Context, guild_id: GuildId) -> Result<()> {
        let severity = CreateCommandOption::new(CommandOptionType::String, "severity", "Waga wpisu")
            .required(true)
            .add_string_choice("low", "low")
            .add_string_choice("medium", "medium")
            .add_string_choice("high", "high");

        guild_id
            .create_command(
                &ctx.http,
                CreateCommand::new("imageguard")
                    .description("Zarządzanie ImageGuard")
                    .default_member_permissions(Permissions::BAN_MEMBERS)
                    .add_option(
                        CreateCommandOption::new(
                            CommandOptionType::SubCommand,
                            "hash-add",
                            "Dodaj obraz do blocklisty hashy",
                        )
                        .add_sub_option(
                            CreateCommandOption::new(CommandOptionType::Attachment, "image", "Obraz")
                                .required(true),
                        )
                        .add_sub_option(severity)
                        .add_sub_option(CreateCommandOption::new(
                            CommandOptionType::String,
                            "reason",
                            "Powód (opcjonalnie)",
                        )),
                    )
                    .add_option(
                        CreateCommandOption::new(
                            CommandOptionType::SubCommand,
                            "hash-remove",
                            "Dezaktywuj wpis blocklisty",
                        )
                        .add_sub_option(
                            CreateCommandOption::new(CommandOptionType::Integer, "id", "ID wpisu")
                                .required(true),
                        ),
                    )
                    .add_option(
                        CreateCommandOption::new(
                            CommandOptionType::SubCommand,
                            "config",
                            "Ustawienia ImageGuard na tym serwerze",
                        )
                        .add_sub_option(CreateCommandOption::new(
                            CommandOptionType::Boolean,
                            "detection",
                            "Skanowanie obrazów",
                        ))
                        .add_sub_option(CreateCommandOption::new(
                            CommandOptionType::Boolean,
                            "auto_delete",
                            "Usuwaj oflagowane wiadomości",
                        ))
                        .add_sub_option(CreateCommandOption::new(
                            CommandOptionType::Boolean,
                            "auto_ban",
                            "Pierwsze przewinienie: ban zamiast timeoutu",
                        ))
                        .add_sub_option(CreateCommandOption::new(
                            CommandOptionType::Channel,
                            "alert_channel",
                            "Kanał alertów",
                        ))
                        .add_sub_option(CreateCommandOption::new(
                            CommandOptionType::Role,
                            "moderator_role",
                            "Dodaj/usuń rolę moderatorów",
                        )),
                    )
                    .add_option(
                        CreateCommandOption::new(
                            CommandOptionType::SubCommand,
                            "user",
                            "Rekord przewinień użytkownika",
                        )
                        .add_sub_option(
                            CreateCommandOption::new(CommandOptionType::User, "user", "Użytkownik")
                                .required(true),
                        ),
                    ),
            )
            .await?;
        Ok(())
    }

    pub async fn on_interaction(ctx: &Context, app: &Arc<AppContext>, interaction: Interaction) {
        if let Some(cmd) = interaction.clone().command() {
            if cmd.data.name == "imageguard" {
                if let Err(e) = Self::on_command(ctx, app, &cmd).await {
                    tracing::warn!(error = ?e, "imageguard cmd failed");
                }
            }
            return;
        }

        if let Some(comp) = interaction.message_component() {
            if let Some((review_id, action)) = parse_review_button(&comp.data.custom_id) {
                let approve = action == "approve";
                if let Err(e) = Self::on_review_button(ctx, app, &comp, review_id, approve).await {
                    tracing::warn!(error = ?e, review_id, "review button failed");
                }
            }
        }
    }

    async fn reply(ctx: &Context, cmd: &CommandInteraction, text: impl Into<String>) {
        let _ = cmd
            .create_response(
                &ctx.http,
                CreateInteractionResponse::Message(
                    CreateInteractionResponseMessage::new()
                        .content(text)
                        .ephemeral(true),
                ),
            )
            .await;
    }

    async fn edit(ctx: &Context, cmd: &CommandInteraction, text: impl Into<String>) {
        let _ = cmd
            .edit_response(&ctx.http, EditInteractionResponse::new().content(text))
            .await;
    }

    async fn on_command(ctx: &Context, app: &Arc<AppContext>, cmd: &CommandInteraction) -> Result<()> {
        let Some(gid) = cmd.guild_id else {
            Self::reply(ctx, cmd, "Użyj na serwerze.").await;
            return Ok(());
        };
        let store = app.engine.store();
        let gcfg = store.guild_config(gid.get()).await?;
        if !member_is_moderator(cmd.member.as_deref(), &gcfg) {
            Self::reply(ctx, cmd, "Brak uprawnień.").await;
            return Ok(());
        }

        let options = cmd.data.options();
        let Some(ResolvedOption {
            name: sub,
            value: ResolvedValue::SubCommand(args),
            ..
        }) = options.first()
        else {
            Self::reply(ctx, cmd, "Nieznana podkomenda.").await;
            return Ok(());
        };

        // operacje sieciowe mogą przekroczyć 3 s
        cmd.defer_ephemeral(&ctx.http).await?;
        let moderator = cmd.user.id.get();

        match *sub {
            "hash-add" => {
                let mut image = None;
                let mut severity = Severity::High;
                let mut reason: Option<String> = None;
                for o in args {
                    match (o.name, &o.value) {
                        ("image", ResolvedValue::Attachment(a)) => image = Some((*a).clone()),
                        ("severity", ResolvedValue::String(s)) => {
                            severity = Severity::parse(s).unwrap_or(Severity::High)
                        }
                        ("reason", ResolvedValue::String(s)) => reason = Some(s.to_string()),
                        _ => {}
                    }
                }
                let Some(att) = image else {
                    Self::edit(ctx, cmd, "Brak załącznika.").await;
                    return Ok(());
                };
                let bytes = match app.engine.downloader().fetch(&att.url).await {
                    Ok(b) => b,
                    Err(e) => {
                        Self::edit(ctx, cmd, format!("Nie udało się pobrać obrazu: {e}")).await;
                        return Ok(());
                    }
                };
                match app
                    .engine
                    .hashes()
                    .add_from_image(Arc::from(bytes), severity, reason.as_deref(), Some(moderator))
                    .await
                {
                    Ok(k) => {
                        Self::edit(
                            ctx,
                            cmd,
                            format!("✅ Dodano wpis **#{}** (`{}`, {}).", k.id, k.hash, severity.as_str()),
                        )
                        .await
                    }
                    Err(e) => Self::edit(ctx, cmd, format!("⛔ Nie udało się dodać hasha: {e:#}")).await,
                }
            }
            "hash-remove" => {
                let id = args.iter().find_map(|o| match (o.name, &o.value) {
                    ("id", ResolvedValue::Integer(v)) => Some(*v),
                    _ => None,
                });
                let Some(id) = id else {
                    Self::edit(ctx, cmd, "Podaj ID.").await;
                    return Ok(());
                };
                let text = if app.engine.hashes().deactivate(id).await? {
                    format!("🗑️ Wpis #{id} dezaktywowany.")
                } else {
                    format!("Wpis #{id} nie istnieje albo jest już nieaktywny.")
                };
                Self::edit(ctx, cmd, text).await;
            }
            "config" => {
                let mut cfg = gcfg.clone();
                for o in args {
                    match (o.name, &o.value) {
                        ("detection", ResolvedValue::Boolean(v)) => cfg.detection_enabled = *v,
                        ("auto_delete", ResolvedValue::Boolean(v)) => cfg.auto_delete = *v,
                        ("auto_ban", ResolvedValue::Boolean(v)) => cfg.auto_ban = *v,
                        ("alert_channel", ResolvedValue::Channel(c)) => cfg.alert_channel_id = Some(c.id.get()),
                        ("moderator_role", ResolvedValue::Role(r)) => {
                            let rid = r.id.get();
                            if let Some(pos) = cfg.moderator_role_ids.iter().position(|x| *x == rid) {
                                cfg.moderator_role_ids.remove(pos);
                            } else {
                                cfg.moderator_role_ids.push(rid);
                            }
                        }
                        _ => {}
                    }
                }
                if cfg != gcfg {
                    store.upsert_guild_config(&cfg).await?;
                    tracing::info!(gid = gid.get(), moderator, "imageguard guild config updated");
                }
                Self::edit(ctx, cmd, render_config(&cfg)).await;
            }
            "user" => {
                let uid = args.iter().find_map(|o| match &o.value {
                    ResolvedValue::User(u, _) => Some(u.id.get()),
                    _ => None,
                });
                let Some(uid) = uid else {
                    Self::edit(ctx, cmd, "Podaj użytkownika.").await;
                    return Ok(());
                };
                let rec = store.offense_record(uid).await?;
                let sanctions = store.sanctions_for_user(uid).await?;
                let mut text = match rec {
                    Some(r) => format!(
                        "<@{uid}>: przewinienia **{}**, globalny ban: **{}**",
                        r.offense_count,
                        if r.globally_banned { "tak" } else { "nie" }
                    ),
                    None => format!("<@{uid}>: brak przewinień."),
                };
                for s in sanctions.iter().rev().take(10) {
                    text.push_str(&format!(
                        "\n• #{} `{}` L{} w `{}` {}",
                        s.id,
                        s.kind.as_str(),
                        s.level,
                        s.guild_id,
                        if s.active { "(aktywna)" } else { "" }
                    ));
                }
                Self::edit(ctx, cmd, text).await;
            }
            _ => Self::edit(ctx, cmd, "Nieznana podkomenda.").await,
        }
        Ok(())
    }

    async fn deny(ctx: &Context, comp: &ComponentInteraction, text: &str) {
        let _ = comp
            .create_response(
                &ctx.http,
                CreateInteractionResponse::Message(
                    CreateInteractionResponseMessage::new()
                        .content(text)
                        .ephemeral(true),
                ),
            )
            .await;
    }

    async fn on_review_button(
        ctx: &Context,
        app: &Arc<AppContext>,
        comp: &ComponentInteraction,
        review_id: i64,
        approve: bool,
    ) -> Result<()> {
        let allowed = match comp.guild_id {
            Some(gid) => {
                let gcfg = app.engine.store().guild_config(gid.get()).await?;
                member_is_moderator(comp.member.as_ref(), &gcfg)
            }
            None => false,
        };
        if !allowed {
            Self::deny(ctx, comp, "Brak uprawnień.").await;
            return Ok(());
        }

        // globalny ban rozstrzyga tylko globalny kanał moderacji
        if let Some(review) = app.engine.store().review(review_id).await? {
            if !app
                .engine
                .escalation()
                .may_decide_in(review.kind, comp.channel_id.get())
            {
                tracing::warn!(
                    review_id,
                    channel = comp.channel_id.get(),
                    uid = comp.user.id.get(),
                    "global ban decision outside the global review channel"
                );
                Self::deny(ctx, comp, "Globalny ban można rozstrzygnąć tylko na kanale globalnej moderacji.").await;
                return Ok(());
            }
        }

        // ack: fan-out banów trwa dłużej niż okno interakcji
        comp.create_response(&ctx.http, CreateInteractionResponse::Acknowledge)
            .await?;
        let moderator = comp.user.id.get();

        let summary = if approve {
            match app.engine.approve_review(review_id, moderator).await {
                Ok(res) => render_resolution(&res, moderator),
                Err(e) => format!("⛔ Błąd: {e:#}"),
            }
        } else {
            match app.engine.reject_review(review_id, moderator).await {
                Ok(ReviewDecision::Applied) => format!("⛔ Odrzucone przez <@{moderator}>."),
                Ok(ReviewDecision::AlreadyDecided(s)) => {
                    format!("⚠️ Ten przegląd został już rozpatrzony ({}).", s.as_str())
                }
                Err(e) => format!("⛔ Błąd: {e:#}"),
            }
        };

        comp.edit_response(
            &ctx.http,
            EditInteractionResponse::new().content(summary).components(vec![]),
        )
        .await?;
        Ok(())
    }
}

fn render_config(cfg: &GuildConfig) -> String {
    let roles = if cfg.moderator_role_ids.is_empty() {
        "brak".to_string()
    } else {
        cfg.moderator_role_ids
            .iter()
            .map(|r| format!("<@&{r}>"))
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        "**ImageGuard**\nDetekcja: `{}`\nAuto-delete: `{}`\nAuto-ban: `{}`\nKanał alertów: {}\nRole moderatorów: {}",
        cfg.detection_enabled,
        cfg.auto_delete,
        cfg.auto_ban,
        cfg.alert_channel_id
            .map(|c| format!("<#{c}>"))
            .unwrap_or_else(|| "brak".into()),
        roles
    )
}

fn render_resolution(res: &ReviewResolution, moderator: u64) -> String {
    match res {
        ReviewResolution::GlobalBan(report) => {
            let ok = report.fanout.succeeded().count();
            let failed = report.fanout.failed().count();
            format!(
                "✅ Globalny ban zatwierdzony przez <@{moderator}>. Serwery: {ok} ok, {failed} błędów."
            )
        }
        ReviewResolution::OffenseConfirmed(outcome) => {
            let what = match outcome {
                EscalationOutcome::LocalSanction { sanction, .. } => {
                    format!("sankcja lokalna `{}`", sanction.kind.as_str())
                }
                EscalationOutcome::PendingReview { review, .. } => {
                    format!("wniosek o globalny ban #{}", review.id)
                }
                EscalationOutcome::AlreadyBanned { .. } => "użytkownik ma już globalny ban".to_string(),
            };
            format!("✅ Potwierdzone przez <@{moderator}>: {what}.")
        }
        ReviewResolution::AlreadyDecided { status } => {
            format!("⚠️ Ten przegląd został już rozpatrzony ({}).", status.as_str())
        }
    }
}
