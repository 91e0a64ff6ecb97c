//! All-in-one process: SMTP frontend, HTTP control plane, dispatch
//! worker pool, and the periodic lease-reaper/registry-refresh tasks
//! in a single binary, for small deployments that don't need the
//! per-role processes split out.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use relay_gateway::api::{ApiServer, ApiState};
use relay_gateway::balancer::LoadBalancer;
use relay_gateway::breaker::BreakerRegistry;
use relay_gateway::dispatch::{run_lease_reaper, DispatchWorker};
use relay_gateway::registry::WorkspaceRegistry;
use relay_gateway::smtp::auth::AuthPolicy;
use relay_gateway::smtp::server::SmtpServer;
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
        "app".to_string(),
        (&config.dispatch).into(),
        stores.messages.clone(),
        registry.clone(),
        balancer,
        rate_limiter.clone(),
        breakers.clone(),
        webhook,
        Arc::new(NullResolver),
    );
    tokio::spawn(dispatch.clone().run(shutdown.clone()));

    tokio::spawn(run_lease_reaper(
        stores.messages.clone(),
        Duration::from_secs(30),
        shutdown.clone(),
    ));

    {
        let registry = registry.clone();
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

    let auth_policy = Arc::new(if config.smtp.require_auth {
        AuthPolicy::Required(Arc::new(relay_gateway::smtp::auth::StaticVerifier::new(Default::default())))
    } else {
        AuthPolicy::Anonymous
    });

    let smtp = SmtpServer::new(
        config.smtp.clone(),
        "relay.local".to_string(),
        stores.messages.clone(),
        auth_policy,
        shutdown.clone(),
    );
    smtp.spawn();

    let api_state = ApiState {
        message_store: stores.messages.clone(),
        pool_store: stores.pools.clone(),
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
    info!("received shutdown signal, stopping services");
    shutdown.cancel();

    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}
