use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{ProviderKind, WorkspaceId};

/// Per-workspace send limits (spec §3). `per_user_daily`/`per_user_hourly`
/// are the defaults applied to any user without an entry in
/// `per_user_overrides`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimits {
    pub daily: i64,
    pub hourly: i64,
    pub per_user_daily: i64,
    pub per_user_hourly: i64,
    #[serde(default)]
    pub per_user_overrides: BTreeMap<String, UserRateOverride>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct UserRateOverride {
    pub daily: Option<i64>,
    pub hourly: Option<i64>,
}

/// Exactly one of these backs a given workspace (spec §3: "provider
/// configuration (exactly one of: ...)"). Credentials are held as
/// opaque strings/bytes here; each [`crate::providers::ProviderAdapter`]
/// is responsible for interpreting its own variant.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum ProviderConfig {
    Gmail {
        service_account_json: String,
        impersonate_user: String,
    },
    Mailgun {
        api_key: String,
        domain: String,
        base_url: String,
    },
    Mandrill {
        api_key: String,
    },
}

impl ProviderConfig {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderConfig::Gmail { .. } => ProviderKind::Gmail,
            ProviderConfig::Mailgun { .. } => ProviderKind::Mailgun,
            ProviderConfig::Mandrill { .. } => ProviderKind::Mandrill,
        }
    }
}

/// Idempotent replacement of a named header before send (spec §4.6),
/// e.g. swapping `List-Unsubscribe` for a provider-specific mailto/URL
/// pair.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeaderRewriteRule {
    pub header_name: String,
    pub replacement: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub display_name: String,
    pub domains: Vec<String>,
    pub provider: ProviderConfig,
    pub limits: RateLimits,
    pub enabled: bool,
    #[serde(default)]
    pub header_rewrites: Vec<HeaderRewriteRule>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    pub fn matches_domain(&self, domain: &str) -> bool {
        self.domains.iter().any(|d| d.eq_ignore_ascii_case(domain))
    }

    pub fn effective_limit(&self, user: Option<&str>) -> (i64, i64) {
        let Some(user) = user else {
            return (self.limits.daily, self.limits.hourly);
        };
        let Some(over) = self.limits.per_user_overrides.get(user) else {
            return (self.limits.per_user_daily, self.limits.per_user_hourly);
        };
        (
            over.daily.unwrap_or(self.limits.per_user_daily),
            over.hourly.unwrap_or(self.limits.per_user_hourly),
        )
    }

    /// Validates that credentials required by the configured provider are
    /// present (spec §4.3: "Validates on load: each enabled workspace has
    /// exactly one configured provider with the required credentials").
    pub fn validate(&self) -> Result<(), String> {
        if self.domains.is_empty() {
            return Err(format!("workspace {} has no domains configured", self.id));
        }
        match &self.provider {
            ProviderConfig::Gmail { service_account_json, impersonate_user } => {
                if service_account_json.trim().is_empty() || impersonate_user.trim().is_empty() {
                    return Err(format!("workspace {} is missing gmail credentials", self.id));
                }
            }
            ProviderConfig::Mailgun { api_key, domain, .. } => {
                if api_key.trim().is_empty() || domain.trim().is_empty() {
                    return Err(format!("workspace {} is missing mailgun credentials", self.id));
                }
            }
            ProviderConfig::Mandrill { api_key } => {
                if api_key.trim().is_empty() {
                    return Err(format!("workspace {} is missing mandrill credentials", self.id));
                }
            }
        }
        Ok(())
    }
}
