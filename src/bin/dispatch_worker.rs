//! Dispatch-only process: leases queued messages, selects a workspace,
//! sends through the configured provider, and runs the lease reaper
//! alongside it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use relay_gateway::balancer::LoadBalancer;
use relay_gateway::breaker::BreakerRegistry;
use relay_gateway::dispatch::{run_lease_reaper, DispatchWorker};
use relay_gateway::registry::WorkspaceRegistry;
use relay_gateway::store::{PoolStore, WorkspaceStore};
use relay_gateway::templating::NullResolver;
use relay_gateway::webhook::WebhookNotifier;
use relay_gateway::{bootstrap, init_tracing, shutdown_signal, AppConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = AppConfig::load().context("failed to load configuration")?;
    let shutdown = CancellationToken::new();

    let (stores, rate_limiter) = bootstrap::connect(&config.storage).await?;
    let registry = WorkspaceRegistry::load(stores.workspaces.as_ref(), stores.pools.as_ref())
        .await
        .context("failed to load initial workspace registry snapshot")?;

    let breakers = Arc::new(BreakerRegistry::new((&config.breaker).into()));
    let balancer = Arc::new(LoadBalancer::new(stores.pools.clone(), rate_limiter.clone(), breakers.clone()));

    let webhook = match config.webhook.url.clone() {
        Some(url) => WebhookNotifier::spawn(url, config.webhook.secret.clone(), (&config.webhook).into(), shutdown.clone()),
        None => WebhookNotifier::disabled(),
    };

    let dispatch = DispatchWorker::new(
        format!("dispatch-{}", std::process::id()),
        (&config.dispatch).into(),
        stores.messages.clone(),
        registry.clone(),
        balancer,
        rate_limiter,
        breakers,
        webhook,
        Arc::new(NullResolver),
    );
    tokio::spawn(dispatch.run(shutdown.clone()));

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
    info!("received shutdown signal, stopping dispatch worker");
    shutdown.cancel();
    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}
