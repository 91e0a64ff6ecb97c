use std::env;

use derive_more::FromStr;
use serde::Serialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod balancer;
pub mod bootstrap;
pub mod breaker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod providers;
pub mod rate_limit;
pub mod registry;
pub mod smtp;
pub mod store;
pub mod templating;
pub mod webhook;

#[cfg(test)]
mod test;

pub use config::AppConfig;
pub use error::DispatchError;

/// Deployment environment. Staging and production log as JSON; development
/// gets a human-readable formatter and is the only environment that treats
/// private outbound IPs / loopback resolvers as acceptable.
#[derive(Debug, Default, Clone, Copy, FromStr, Serialize, PartialEq, Eq)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub enum Environment {
    Staging,
    Production,
    #[default]
    Development,
}

impl Environment {
    pub fn from_env() -> Self {
        env::var("ENVIRONMENT")
            .map(|s| s.parse())
            .inspect_err(|_| {
                tracing::warn!("Did not find ENVIRONMENT env var, defaulting to development")
            })
            .unwrap_or(Ok(Environment::Development))
            .expect(
                "Invalid ENVIRONMENT env var, must be one of: development, production, or staging",
            )
    }
}

pub fn init_tracing() {
    let environment = Environment::from_env();
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!("{}=trace,tower_http=debug,axum=trace,info", env!("CARGO_CRATE_NAME")).into()
        }),
    );

    if matches!(environment, Environment::Development) {
        registry.with(tracing_subscriber::fmt::layer()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    }
}

/// Waits for either an explicit cancellation, Ctrl+C, or SIGTERM.
pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
