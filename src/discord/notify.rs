use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serenity::all::{
    ButtonStyle, ChannelId, Colour, CreateActionRow, CreateButton, CreateEmbed, CreateEmbedFooter,
    CreateMessage, Http,
};

use crate::escalation::{DetectionAlert, Notifier, ReviewAlert};
use crate::store::ReviewKind;

pub const BRAND_FOOTER: &str = "Tigris ImageGuard";

pub struct SerenityNotifier {
    http: Arc<Http>,
}

impl SerenityNotifier {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

/// `igr:{review_id}:approve|reject`
pub fn review_buttons(review_id: i64) -> CreateActionRow {
    CreateActionRow::Buttons(vec![
        CreateButton::new(format!("igr:{review_id}:approve"))
            .label("✅ Zatwierdź")
            .style(ButtonStyle::Danger),
        CreateButton::new(format!("igr:{review_id}:reject"))
            .label("⛔ Odrzuć")
            .style(ButtonStyle::Secondary),
    ])
}

pub fn detection_embed(a: &DetectionAlert) -> CreateEmbed {
    let colour = if a.requires_review {
        Colour::ORANGE
    } else {
        Colour::RED
    };
    CreateEmbed::new()
        .title(if a.requires_review {
            "🔎 Obraz do weryfikacji"
        } else {
            "🚫 Wykryto zakazany obraz"
        })
        .colour(colour)
        .field("Użytkownik", format!("<@{}> (`{}`)", a.user_id, a.user_id), true)
        .field("Metoda", &a.method, true)
        .field("Pewność", format!("{:.1}%", a.confidence * 100.0), true)
        .field("Akcja", &a.action_taken, true)
        .field("Wymaga przeglądu", if a.requires_review { "tak" } else { "nie" }, true)
        .footer(CreateEmbedFooter::new(format!("{BRAND_FOOTER} • detekcja #{}", a.detection_id)))
}

pub fn review_embed(a: &ReviewAlert) -> CreateEmbed {
    let (title, desc) = match a.kind {
        ReviewKind::GlobalBan => (
            "🌐 Wniosek o globalny ban",
            format!(
                "Kolejne przewinienie (łącznie **{}**). Zatwierdzenie banuje użytkownika na wszystkich serwerach.",
                a.offense_count
            ),
        ),
        ReviewKind::Detection => (
            "🔎 Detekcja do potwierdzenia",
            "Pewność w paśmie przeglądu. Zatwierdzenie liczy się jako przewinienie.".to_string(),
        ),
    };
    CreateEmbed::new()
        .title(title)
        .description(desc)
        .colour(Colour::ORANGE)
        .field("Użytkownik", format!("<@{}> (`{}`)", a.user_id, a.user_id), true)
        .field("Serwer", format!("`{}`", a.guild_id), true)
        .field("Detekcja", format!("#{}", a.detection_id), true)
        .footer(CreateEmbedFooter::new(format!("{BRAND_FOOTER} • przegląd #{}", a.review_id)))
}

#[async_trait]
impl Notifier for SerenityNotifier {
    async fn detection_alert(&self, alert: &DetectionAlert) -> Result<()> {
        ChannelId::new(alert.channel_id)
            .send_message(&self.http, CreateMessage::new().embed(detection_embed(alert)))
            .await?;
        Ok(())
    }

    async fn review_alert(&self, alert: &ReviewAlert) -> Result<()> {
        ChannelId::new(alert.channel_id)
            .send_message(
                &self.http,
                CreateMessage::new()
                    .embed(review_embed(alert))
                    .components(vec![review_buttons(alert.review_id)]),
            )
            .await?;
        Ok(())
    }
}
