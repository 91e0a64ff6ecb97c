//! Load Balancer / Pool Selector (spec §4.4): maps a sender domain to a
//! pool, then picks one eligible member workspace using the pool's
//! configured strategy. Every successful pick is audited via
//! [`PoolStore::record_selection`] before the caller makes its provider
//! call.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use thiserror::Error;

use crate::breaker::BreakerRegistry;
use crate::models::{Pool, PoolId, RateScope, Selection, SelectionStrategy, Workspace, WorkspaceId};
use crate::rate_limit::{RateLimitError, RateLimiter};
use crate::registry::Snapshot;
use crate::store::{PoolStore, StoreError};

const LEAST_USED_WINDOW: ChronoDuration = ChronoDuration::hours(1);

#[derive(Debug, Clone, Copy)]
pub struct Selected {
    pub pool_id: PoolId,
    pub workspace_id: WorkspaceId,
    pub strategy_used: SelectionStrategy,
}

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("no pool matches sender domain {0} and no default pool is configured")]
    NoPool(String),
    /// Spec §4.4 "Fallback": no member workspace is eligible right now.
    /// `retry_after` is the earliest moment any excluded member might
    /// become eligible again, if known.
    #[error("no eligible workspace in pool")]
    NoCapacity { retry_after: Option<DateTime<Utc>> },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
}

/// Composes the registry snapshot, rate limiter, and breaker registry to
/// turn a sender address into a concrete `(pool, workspace)` pick.
pub struct LoadBalancer {
    pool_store: Arc<dyn PoolStore>,
    rate_limiter: Arc<dyn RateLimiter>,
    breakers: Arc<BreakerRegistry>,
}

impl LoadBalancer {
    pub fn new(
        pool_store: Arc<dyn PoolStore>,
        rate_limiter: Arc<dyn RateLimiter>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self { pool_store, rate_limiter, breakers }
    }

    /// `sender_email` is the envelope `MAIL FROM` address; only its
    /// domain is used for matching, but the full address is written to
    /// the [`Selection`] audit row.
    pub async fn select(
        &self,
        snapshot: &Snapshot,
        sender_email: &str,
        now: DateTime<Utc>,
    ) -> Result<Selected, SelectError> {
        let domain = sender_email.rsplit('@').next().unwrap_or(sender_email);
        let pool = Self::match_pool(snapshot, domain).ok_or_else(|| SelectError::NoPool(domain.to_string()))?;

        let (eligible, earliest_retry) = self.eligible_members(pool, snapshot, now).await?;
        if eligible.is_empty() {
            return Err(SelectError::NoCapacity { retry_after: earliest_retry });
        }

        let workspace_id = match pool.strategy {
            SelectionStrategy::RoundRobin => self.round_robin(pool, &eligible).await?,
            SelectionStrategy::CapacityWeighted => self.capacity_weighted(&eligible, snapshot, now).await?,
            SelectionStrategy::LeastUsed => self.least_used(&eligible, now).await?,
            SelectionStrategy::RandomWeighted => Self::random_weighted(pool, &eligible),
        };

        self.pool_store
            .record_selection(Selection {
                pool_id: pool.id,
                workspace_id,
                strategy_used: pool.strategy,
                sender_email: sender_email.to_string(),
                selected_at: now,
            })
            .await?;

        Ok(Selected { pool_id: pool.id, workspace_id, strategy_used: pool.strategy })
    }

    /// First enabled pool whose domain patterns match, else the default.
    fn match_pool<'a>(snapshot: &'a Snapshot, sender_domain: &str) -> Option<&'a Pool> {
        snapshot
            .pools
            .iter()
            .find(|pool| pool.matches_sender_domain(sender_domain))
            .or_else(|| snapshot.default_pool())
    }

    /// A member is eligible when its workspace exists and is enabled,
    /// its provider's breaker isn't open, and its daily quota isn't
    /// exhausted. Tracks the earliest known retry point across excluded
    /// members for the `NoCapacity` fallback.
    async fn eligible_members(
        &self,
        pool: &Pool,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
    ) -> Result<(Vec<WorkspaceId>, Option<DateTime<Utc>>), SelectError> {
        let mut eligible = Vec::new();
        let mut earliest_retry: Option<DateTime<Utc>> = None;
        let mut note_retry = |at: DateTime<Utc>| {
            earliest_retry = Some(earliest_retry.map_or(at, |current: DateTime<Utc>| current.min(at)));
        };

        for &workspace_id in &pool.member_workspace_ids {
            let Some(workspace) = snapshot.workspace(workspace_id) else { continue };
            if !workspace.enabled {
                continue;
            }

            let provider = workspace.provider.kind();
            if !self.breakers.allows_request(provider) {
                note_retry(self.breakers.next_probe_at(provider).unwrap_or(now + ChronoDuration::seconds(30)));
                continue;
            }

            let usage = self
                .rate_limiter
                .usage(RateScope::WorkspaceDaily, workspace_id, None, workspace.limits.daily, now)
                .await?;
            if usage.exhausted() {
                note_retry(usage.bucket_end);
                continue;
            }

            eligible.push(workspace_id);
        }

        Ok((eligible, earliest_retry))
    }

    /// Per-pool cursor, advanced modulo the *currently eligible* set —
    /// ineligible members are simply absent from `eligible`, so the
    /// cursor naturally skips them without separate bookkeeping.
    async fn round_robin(&self, pool: &Pool, eligible: &[WorkspaceId]) -> Result<WorkspaceId, SelectError> {
        let index = self.pool_store.next_round_robin_index(pool.id, eligible.len()).await?;
        Ok(eligible[index])
    }

    /// Weight is each workspace's remaining daily capacity. Allocating a
    /// single unit by largest-remainder reduces to picking the largest
    /// weight (floor(weight / total) is always zero for one seat, so the
    /// full weight is the remainder); ties favor the lowest workspace id.
    async fn capacity_weighted(
        &self,
        eligible: &[WorkspaceId],
        snapshot: &Snapshot,
        now: DateTime<Utc>,
    ) -> Result<WorkspaceId, SelectError> {
        let mut best: Option<(WorkspaceId, i64)> = None;
        for &id in eligible {
            let workspace: &Workspace = snapshot.workspace(id).expect("eligible members exist in the snapshot");
            let usage = self
                .rate_limiter
                .usage(RateScope::WorkspaceDaily, id, None, workspace.limits.daily, now)
                .await?;
            let remaining = usage.remaining();
            best = Some(match best {
                Some((best_id, best_remaining)) if remaining <= best_remaining && (remaining != best_remaining || id >= best_id) => {
                    (best_id, best_remaining)
                }
                _ => (id, remaining),
            });
        }
        Ok(best.expect("eligible is non-empty").0)
    }

    /// Smallest selection count over the trailing window, ties broken by
    /// lowest workspace id.
    async fn least_used(&self, eligible: &[WorkspaceId], now: DateTime<Utc>) -> Result<WorkspaceId, SelectError> {
        let since = now - LEAST_USED_WINDOW;
        let mut best: Option<(WorkspaceId, i64)> = None;
        for &id in eligible {
            let count = self.pool_store.selection_count_since(id, since).await?;
            best = Some(match best {
                Some((best_id, best_count)) if count >= best_count && (count != best_count || id >= best_id) => {
                    (best_id, best_count)
                }
                _ => (id, count),
            });
        }
        Ok(best.expect("eligible is non-empty").0)
    }

    fn random_weighted(pool: &Pool, eligible: &[WorkspaceId]) -> WorkspaceId {
        let weights: Vec<u32> = eligible.iter().map(|id| pool.weight_for(*id)).collect();
        let total: u32 = weights.iter().sum::<u32>().max(1);
        let mut pick = rand::rng().random_range(0..total);
        for (id, weight) in eligible.iter().zip(weights.iter()) {
            if pick < *weight {
                return *id;
            }
            pick -= *weight;
        }
        *eligible.last().expect("eligible is non-empty")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::ProviderConfig;
    use crate::rate_limit::memory::InMemoryRateLimiter;
    use crate::store::memory::InMemoryStore;

    fn workspace(domains: Vec<&str>, daily: i64) -> Workspace {
        Workspace {
            id: WorkspaceId::new(),
            display_name: "w".into(),
            domains: domains.into_iter().map(str::to_string).collect(),
            provider: ProviderConfig::Mandrill { api_key: "key".into() },
            limits: crate::models::RateLimits { daily, hourly: daily, per_user_daily: daily, per_user_hourly: daily, per_user_overrides: Default::default() },
            enabled: true,
            header_rewrites: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn pool(strategy: SelectionStrategy, members: Vec<WorkspaceId>) -> Pool {
        Pool {
            id: PoolId::new(),
            name: "p".into(),
            domain_patterns: vec!["*.test".into()],
            member_workspace_ids: members,
            strategy,
            enabled: true,
            is_default: true,
            weights: Default::default(),
            selection_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn snapshot(workspaces: Vec<Workspace>, pools: Vec<Pool>) -> Snapshot {
        Snapshot::build(workspaces, pools)
    }

    #[tokio::test]
    async fn round_robin_cycles_in_member_order() {
        let w1 = workspace(vec!["a.test"], 100);
        let w2 = workspace(vec!["a.test"], 100);
        let w3 = workspace(vec!["a.test"], 100);
        let (id1, id2, id3) = (w1.id, w2.id, w3.id);
        let pool = pool(SelectionStrategy::RoundRobin, vec![id1, id2, id3]);
        let pool_id = pool.id;
        let snapshot = snapshot(vec![w1, w2, w3], vec![pool]);

        let pool_store: Arc<dyn PoolStore> = Arc::new(InMemoryStore::new());
        pool_store.create_pool(snapshot.pools[0].clone()).await.unwrap();
        let rate_limiter: Arc<dyn RateLimiter> = Arc::new(InMemoryRateLimiter::new());
        let breakers = Arc::new(BreakerRegistry::new(Default::default()));
        let balancer = LoadBalancer::new(pool_store, rate_limiter, breakers);

        let mut picks = Vec::new();
        for _ in 0..6 {
            let selected = balancer.select(&snapshot, "u@a.test", Utc::now()).await.unwrap();
            assert_eq!(selected.pool_id, pool_id);
            picks.push(selected.workspace_id);
        }
        assert_eq!(picks, vec![id1, id2, id3, id1, id2, id3]);
    }

    #[tokio::test]
    async fn no_matching_pool_falls_back_to_default() {
        let w1 = workspace(vec!["a.test"], 100);
        let id1 = w1.id;
        let mut default_pool = pool(SelectionStrategy::RoundRobin, vec![id1]);
        default_pool.domain_patterns = vec!["unrelated.test".into()];
        default_pool.is_default = true;
        let snapshot = snapshot(vec![w1], vec![default_pool]);

        let pool_store: Arc<dyn PoolStore> = Arc::new(InMemoryStore::new());
        pool_store.create_pool(snapshot.pools[0].clone()).await.unwrap();
        let rate_limiter: Arc<dyn RateLimiter> = Arc::new(InMemoryRateLimiter::new());
        let breakers = Arc::new(BreakerRegistry::new(Default::default()));
        let balancer = LoadBalancer::new(pool_store, rate_limiter, breakers);

        let selected = balancer.select(&snapshot, "u@other.test", Utc::now()).await.unwrap();
        assert_eq!(selected.workspace_id, id1);
    }

    #[tokio::test]
    async fn exhausted_quota_yields_no_capacity() {
        let w1 = workspace(vec!["a.test"], 0);
        let id1 = w1.id;
        let pool = pool(SelectionStrategy::RoundRobin, vec![id1]);
        let snapshot = snapshot(vec![w1], vec![pool]);

        let pool_store: Arc<dyn PoolStore> = Arc::new(InMemoryStore::new());
        pool_store.create_pool(snapshot.pools[0].clone()).await.unwrap();
        let rate_limiter: Arc<dyn RateLimiter> = Arc::new(InMemoryRateLimiter::new());
        let breakers = Arc::new(BreakerRegistry::new(Default::default()));
        let balancer = LoadBalancer::new(pool_store, rate_limiter, breakers);

        let err = balancer.select(&snapshot, "u@a.test", Utc::now()).await.unwrap_err();
        assert!(matches!(err, SelectError::NoCapacity { .. }));
    }
}
