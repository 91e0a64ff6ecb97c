use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres-store", sqlx(type_name = "provider_kind", rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Gmail,
    Mailgun,
    Mandrill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Snapshot of a provider's circuit breaker, surfaced on `/api/rate-limit`
/// and `/health/detailed` (spec §3).
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProviderHealth {
    pub provider: ProviderKind,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub next_probe_at: Option<DateTime<Utc>>,
}
