//! Runs pending SQL migrations against `DATABASE_URL` and exits. Kept
//! separate from the long-running binaries so migrations can be a
//! distinct deploy step.

use anyhow::Context;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::ConnectOptions;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "sqlx=debug".into()))
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let options: PgConnectOptions = database_url.parse().context("DATABASE_URL must be a valid URL")?;
    let options = options.application_name("relay-gateway-migrate-db");

    let pool = PgPoolOptions::new().max_connections(5).connect_with(options).await.context("failed to connect to database")?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(())
}
