//! HTTP-only process: the `/api/*` control plane and `/health` family,
//! with no SMTP listener and no dispatch loop of its own. Still needs a
//! [`relay_gateway::dispatch::DispatchWorker`] handle to back
//! `POST /api/process`, but never calls `.run()` on it — that belongs
//! to the `dispatch-worker` process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use relay_gateway::api::{ApiServer, ApiState};
use relay_gateway::balancer::LoadBalancer;
use relay_gateway::breaker::BreakerRegistry;
use relay_gateway::dispatch::DispatchWorker;
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

    // Dormant: this process never calls `.run()`, so `trigger_sweep()`
    // wakes the actual dispatch-worker process's loop, not this one.
    let dispatch = DispatchWorker::new(
        "control-plane".to_string(),
        (&config.dispatch).into(),
        stores.messages.clone(),
        registry.clone(),
        balancer,
        rate_limiter.clone(),
        breakers.clone(),
        WebhookNotifier::disabled(),
        Arc::new(NullResolver),
    );

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

    let api_state = ApiState {
        message_store: stores.messages,
        pool_store: stores.pools,
        registry,
        rate_limiter,
        breakers,
        dispatch,
        started_at: chrono::Utc::now(),
        max_body_bytes: config.smtp.max_body_bytes as usize,
    };
    let api = ApiServer::new(config.http.listen_addr, api_state, shutdown.clone());
    api.spawn();

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping control plane");
    shutdown.cancel();
    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}
