//! Configuration loader (spec §6): a typed document assembled from
//! `RELAY_CONFIG` (a file path) or `RELAY_CONFIG_JSON` (an inline JSON
//! document), following the `Environment`/`.env` pattern the rest of
//! this crate carries from `src/lib.rs`.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::breaker::BreakerConfig;
use crate::dispatch::backoff::BackoffConfig;
use crate::dispatch::DispatchConfig;
use crate::webhook::WebhookConfig as RuntimeWebhookConfig;
use crate::Environment;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("neither RELAY_CONFIG nor RELAY_CONFIG_JSON is set")]
    Missing,
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Storage backend selection (spec §9 Design Note: backend chosen at
/// startup, not per-call).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    Memory,
    Postgres { database_url: String, max_connections: u32 },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SmtpSettings {
    pub listen_addr: SocketAddr,
    pub max_body_bytes: u64,
    /// When `false`, any peer on `listen_addr` may relay without
    /// authenticating (spec §4.8 "accept anonymous from trusted
    /// network"). When `true`, `AUTH PLAIN`/`LOGIN` is required before
    /// `MAIL FROM`.
    pub require_auth: bool,
    pub command_timeout_secs: u64,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

impl Default for SmtpSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:2525".parse().expect("valid default socket addr"),
            max_body_bytes: 20 * 1024 * 1024,
            require_auth: true,
            command_timeout_secs: 60,
            cert_file: None,
            key_file: None,
        }
    }
}

impl SmtpSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpSettings {
    pub listen_addr: SocketAddr,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self { listen_addr: "0.0.0.0:8080".parse().expect("valid default socket addr") }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebhookSettings {
    pub url: Option<String>,
    pub secret: String,
    pub max_attempts: u32,
    pub queue_capacity: usize,
    pub backoff: BackoffSettings,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        let defaults = RuntimeWebhookConfig::default();
        Self {
            url: None,
            secret: String::new(),
            max_attempts: defaults.max_attempts,
            queue_capacity: defaults.queue_capacity,
            backoff: BackoffSettings::default(),
        }
    }
}

impl From<&WebhookSettings> for RuntimeWebhookConfig {
    fn from(settings: &WebhookSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            backoff: (&settings.backoff).into(),
            queue_capacity: settings.queue_capacity,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub base_secs: u64,
    pub max_secs: u64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        let defaults = BackoffConfig::default();
        Self { base_secs: defaults.base.as_secs(), max_secs: defaults.max.as_secs() }
    }
}

impl From<&BackoffSettings> for BackoffConfig {
    fn from(settings: &BackoffSettings) -> Self {
        Self { base: Duration::from_secs(settings.base_secs), max: Duration::from_secs(settings.max_secs) }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub worker_concurrency: usize,
    pub max_batch: usize,
    pub visibility_timeout_secs: u64,
    pub max_attempts: i32,
    pub poll_interval_millis: u64,
    pub backoff: BackoffSettings,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        let defaults = DispatchConfig::default();
        Self {
            worker_concurrency: defaults.worker_concurrency,
            max_batch: defaults.max_batch,
            visibility_timeout_secs: defaults.visibility_timeout.as_secs(),
            max_attempts: defaults.max_attempts,
            poll_interval_millis: defaults.poll_interval.as_millis() as u64,
            backoff: BackoffSettings::default(),
        }
    }
}

impl From<&DispatchSettings> for DispatchConfig {
    fn from(settings: &DispatchSettings) -> Self {
        Self {
            worker_concurrency: settings.worker_concurrency,
            max_batch: settings.max_batch,
            visibility_timeout: Duration::from_secs(settings.visibility_timeout_secs),
            max_attempts: settings.max_attempts,
            poll_interval: Duration::from_millis(settings.poll_interval_millis),
            backoff: (&settings.backoff).into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout_secs: i64,
    pub max_probes: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        let defaults = BreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            success_threshold: defaults.success_threshold,
            recovery_timeout_secs: defaults.recovery_timeout.num_seconds(),
            max_probes: defaults.max_probes,
        }
    }
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            success_threshold: settings.success_threshold,
            recovery_timeout: chrono::Duration::seconds(settings.recovery_timeout_secs),
            max_probes: settings.max_probes,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryRefreshSettings {
    pub period_secs: u64,
}

impl Default for RegistryRefreshSettings {
    fn default() -> Self {
        Self { period_secs: 30 }
    }
}

/// Top-level configuration document (spec §6). Deserialized from JSON;
/// workspaces/pools themselves live in the store, not here, and are
/// refreshed at runtime (spec §4.3).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub smtp: SmtpSettings,
    pub http: HttpSettings,
    pub storage: StorageConfig,
    pub webhook: WebhookSettings,
    pub dispatch: DispatchSettings,
    pub breaker: BreakerSettings,
    pub registry_refresh: RegistryRefreshSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            smtp: SmtpSettings::default(),
            http: HttpSettings::default(),
            storage: StorageConfig::default(),
            webhook: WebhookSettings::default(),
            dispatch: DispatchSettings::default(),
            breaker: BreakerSettings::default(),
            registry_refresh: RegistryRefreshSettings::default(),
        }
    }
}

impl AppConfig {
    /// Loads `RELAY_CONFIG_JSON` if set, else reads the file named by
    /// `RELAY_CONFIG`. `.env` is applied by the caller via `dotenvy`
    /// before this runs, same as `Environment::from_env`.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(inline) = std::env::var("RELAY_CONFIG_JSON") {
            return Ok(serde_json::from_str(&inline)?);
        }

        let path = std::env::var("RELAY_CONFIG").map_err(|_| ConfigError::Missing)?;
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read { path, source })?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn environment() -> Environment {
        Environment::from_env()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.smtp.listen_addr, config.smtp.listen_addr);
    }

    #[test]
    fn partial_document_falls_back_to_defaults() {
        let parsed: AppConfig = serde_json::from_str(r#"{"smtp": {"require_auth": false}}"#).unwrap();
        assert!(!parsed.smtp.require_auth);
        assert_eq!(parsed.smtp.max_body_bytes, SmtpSettings::default().max_body_bytes);
        assert_eq!(parsed.http.listen_addr, HttpSettings::default().listen_addr);
    }
}
