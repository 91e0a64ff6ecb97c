use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

use crate::models::{PoolId, WorkspaceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres-store", sqlx(type_name = "selection_strategy", rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    CapacityWeighted,
    LeastUsed,
    RandomWeighted,
}

/// A domain-glob → workspace-set routing rule (spec §3/§4.4).
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct Pool {
    pub id: PoolId,
    pub name: String,
    /// Glob patterns (`*` wildcard) matched against the sender domain,
    /// in priority order.
    pub domain_patterns: Vec<String>,
    pub member_workspace_ids: Vec<WorkspaceId>,
    pub strategy: SelectionStrategy,
    pub enabled: bool,
    /// Used by default when no other pool matches (spec §4.4 "Fallback").
    pub is_default: bool,
    #[serde(default)]
    pub weights: BTreeMap<WorkspaceId, u32>,
    pub selection_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pool {
    /// Glob matching with a single `*` wildcard, anchored at both ends
    /// (e.g. `*.example.com` matches `mail.example.com` but not
    /// `example.com`; a pattern without `*` must match exactly).
    pub fn domain_matches(pattern: &str, domain: &str) -> bool {
        let pattern = pattern.to_ascii_lowercase();
        let domain = domain.to_ascii_lowercase();

        match pattern.split_once('*') {
            None => pattern == domain,
            Some((prefix, suffix)) => {
                domain.len() >= prefix.len() + suffix.len()
                    && domain.starts_with(prefix)
                    && domain.ends_with(suffix)
            }
        }
    }

    pub fn matches_sender_domain(&self, domain: &str) -> bool {
        self.enabled && self.domain_patterns.iter().any(|p| Self::domain_matches(p, domain))
    }

    pub fn weight_for(&self, workspace_id: WorkspaceId) -> u32 {
        self.weights.get(&workspace_id).copied().unwrap_or(1)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn glob_matching() {
        assert!(Pool::domain_matches("*.example.com", "mail.example.com"));
        assert!(!Pool::domain_matches("*.example.com", "example.com"));
        assert!(Pool::domain_matches("example.com", "example.com"));
        assert!(!Pool::domain_matches("example.com", "sub.example.com"));
        assert!(Pool::domain_matches("*", "anything.test"));
    }
}
