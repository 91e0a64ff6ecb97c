//! SMTP-only process: accepts mail and enqueues it. Dispatch, the HTTP
//! control plane, and the periodic sweeps run in their own processes
//! (`dispatch-worker`, `control-plane`, `periodic`).

use std::sync::Arc;

use anyhow::Context;
use relay_gateway::smtp::auth::{AuthPolicy, StaticVerifier};
use relay_gateway::smtp::server::SmtpServer;
use relay_gateway::{bootstrap, init_tracing, shutdown_signal, AppConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = AppConfig::load().context("failed to load configuration")?;
    let shutdown = CancellationToken::new();

    let (stores, _rate_limiter) = bootstrap::connect(&config.storage).await?;

    let auth_policy = Arc::new(if config.smtp.require_auth {
        AuthPolicy::Required(Arc::new(StaticVerifier::new(Default::default())))
    } else {
        AuthPolicy::Anonymous
    });

    let server = SmtpServer::new(config.smtp, "relay.local".to_string(), stores.messages, auth_policy, shutdown.clone());

    server.spawn();

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping SMTP frontend");
    shutdown.cancel();
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    Ok(())
}
