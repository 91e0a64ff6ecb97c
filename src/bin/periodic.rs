//! Periodic-only process: lease reaper and workspace/pool registry
//! refresh, for deployments that split dispatch out from housekeeping.

use std::time::Duration;

use anyhow::Context;
use relay_gateway::registry::WorkspaceRegistry;
use relay_gateway::store::{PoolStore, WorkspaceStore};
use relay_gateway::{bootstrap, init_tracing, shutdown_signal, AppConfig};
use relay_gateway::dispatch::run_lease_reaper;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = AppConfig::load().context("failed to load configuration")?;
    let shutdown = CancellationToken::new();

    let (stores, _rate_limiter) = bootstrap::connect(&config.storage).await?;
    let registry = WorkspaceRegistry::load(stores.workspaces.as_ref(), stores.pools.as_ref())
        .await
        .context("failed to load initial workspace registry snapshot")?;

    tokio::spawn(run_lease_reaper(stores.messages, Duration::from_secs(30), shutdown.clone()));

    {
        let workspaces = stores.workspaces.clone();
        let pools = stores.pools.clone();
        registry.spawn_refresher(Duration::from_secs(config.registry_refresh.period_secs), shutdown.clone(), move || {
            let workspaces = workspaces.clone();
            let pools = pools.clone();
            async move {
                let ws = workspaces.list_workspaces().await?;
                let pl = pools.list_pools().await?;
                Ok((ws, pl))
            }
        });
    }

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping periodic tasks");
    shutdown.cancel();
    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}
