use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::{Executor, Pool, Postgres, postgres::PgPoolOptions};

use crate::config::Database;

pub type Db = Pool<Postgres>;

/// Pula połączeń; `statement_timeout` ustawiany na każdym nowym połączeniu.
pub async fn connect(cfg: &Database) -> Result<Db> {
    let timeout_ms = cfg.statement_timeout_ms;
    let pool = PgPoolOptions::new()
        .max_connections(cfg.max_connections.unwrap_or(10))
        .acquire_timeout(Duration::from_secs(10))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                if let Some(ms) = timeout_ms {
                    conn.execute(format!("SET statement_timeout = {ms}").as_str())
                        .await?;
                }
                Ok(())
            })
        })
        .connect(&cfg.url)
        .await
        .context("postgres connect failed")?;

    Ok(pool)
}

pub async fn migrate(pool: &Db) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("imageguard migrations failed")?;
    Ok(())
}
