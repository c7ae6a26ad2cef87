use crate::config::Settings;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Inicjalizacja logowania.
/// RUST_LOG ma pierwszeństwo, potem `logging.level` z konfiguracji.
pub fn init(settings: &Settings) {
    let level = settings
        .logging
        .level
        .clone()
        .unwrap_or_else(|| "info".to_string());

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Format tekstowy; bez .json(), żeby nie wymagać extra feature w Cargo.toml
    let fmt_layer = fmt::layer().with_target(true);

    // try_init: w testach subskrybent może już istnieć
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}
