//! Schema migrations applied straight against Postgres, bypassing the REST gateway.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

/// Applies pending migrations, then asks the gateway to reload its schema cache so the new
/// tables are writable without waiting for the cache to catch up.
pub async fn run_migrations(database_url: &str) -> Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(database_url)
        .await
        .context("connecting to DATABASE_URL")?;

    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .context("applying migrations")?;

    sqlx::query("NOTIFY pgrst, 'reload schema'")
        .execute(&pool)
        .await
        .context("notifying gateway to reload schema")?;

    info!("migrations applied; gateway schema reload requested");
    pool.close().await;
    Ok(())
}
