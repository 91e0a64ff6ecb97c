use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::{PoolId, SelectionStrategy, WorkspaceId};

/// Append-only audit row written before a provider call for a given
/// attempt (spec §3/§4.4). Retention is bounded by the store, not by
/// this type.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct Selection {
    pub pool_id: PoolId,
    pub workspace_id: WorkspaceId,
    pub strategy_used: SelectionStrategy,
    pub sender_email: String,
    pub selected_at: DateTime<Utc>,
}
