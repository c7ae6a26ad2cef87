// src/lib.rs

pub mod api;
pub mod classifier;
pub mod config;
pub mod db;
pub mod discord;
pub mod download;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod hashing;
pub mod logging;
pub mod policy;
pub mod prefilter;
pub mod scanner;
pub mod scheduler;
pub mod store;

use anyhow::Result;
use std::sync::Arc;

use config::Settings;
use engine::Engine;
use store::{MemoryStore, PgStore, Store};

use serenity::all::{GatewayIntents, Http};

/// Globalny kontekst aplikacji: konfiguracja + gotowy silnik.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Settings,
    pub engine: Arc<Engine>,
}

impl AppContext {
    /// Bootstrap całej aplikacji:
    /// - logi
    /// - magazyn (Postgres + migracje, albo pamięć gdy `database.url` jest pusty)
    /// - klasyfikator, egzekucja, powiadomienia, silnik
    pub async fn bootstrap(settings: Settings) -> Result<Arc<Self>> {
        // 1) logi
        logging::init(&settings);
        if settings.escalation.review_channel_id == 0 {
            tracing::warn!("escalation.review_channel_id not set, global ban reviews will stay pending");
        }

        // 2) magazyn
        let store: Arc<dyn Store> = if settings.database.url.trim().is_empty() {
            tracing::warn!("database.url is empty, using in-memory store (state is lost on restart)");
            Arc::new(MemoryStore::new())
        } else {
            let db = db::connect(&settings.database).await?;
            db::migrate(&db).await?;
            Arc::new(PgStore::new(db))
        };

        // 3) kolaboratorzy
        let http = Arc::new(Http::new(&settings.discord.token));
        let classifier = Arc::new(classifier::ClassifierAdapter::from_config(&settings.classifier)?);
        let enforcer = Arc::new(discord::enforcer::SerenityEnforcer::new(http.clone()));
        let notifier = Arc::new(discord::notify::SerenityNotifier::new(http));

        // 4) silnik
        let engine = Arc::new(Engine::from_settings(&settings, store, classifier, enforcer, notifier)?);

        Ok(Arc::new(Self { settings, engine }))
    }

    /// Środowisko: "production" | "development".
    #[inline]
    pub fn env(&self) -> &str {
        &self.settings.env
    }
}

/// Minimalny zestaw intents:
/// - GUILDS, GUILD_MESSAGES, MESSAGE_CONTENT (załączniki),
/// - GUILD_MEMBERS (egzekucja globalnego bana przy dołączeniu).
pub fn default_gateway_intents() -> GatewayIntents {
    GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_MEMBERS
}

/// Start: opcjonalny endpoint statusu + klient Discorda.
pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    if let Some(bind) = ctx.settings.api.bind.as_deref() {
        let addr = bind.parse()?;
        let engine = ctx.engine.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(addr, engine).await {
                tracing::error!(error=?e, "status endpoint stopped");
            }
        });
    }

    discord::run_bot(ctx).await
}
