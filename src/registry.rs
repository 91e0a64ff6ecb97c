//! Workspace/pool configuration registry (spec §4.3): a lock-free
//! immutable snapshot refreshed on a background poll, so the hot send
//! path never blocks on a lock a slow config reload might be holding.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::models::{Pool, Workspace, WorkspaceId};
use crate::store::{PoolStore, WorkspaceStore};

/// A point-in-time, validated view of all workspaces and pools.
/// `by_domain` indexes enabled workspaces by lowercased exact domain for
/// O(1) sender-domain lookups; pool domain-glob matching still needs a
/// linear scan over `pools` (spec §4.4 patterns aren't indexable).
pub struct Snapshot {
    pub workspaces: HashMap<WorkspaceId, Workspace>,
    pub pools: Vec<Pool>,
    by_domain: HashMap<String, Vec<WorkspaceId>>,
}

impl Snapshot {
    pub fn build(workspaces: Vec<Workspace>, pools: Vec<Pool>) -> Self {
        let mut by_domain: HashMap<String, Vec<WorkspaceId>> = HashMap::new();
        let mut by_id = HashMap::new();

        for workspace in workspaces {
            if workspace.enabled {
                for domain in &workspace.domains {
                    by_domain.entry(domain.to_ascii_lowercase()).or_default().push(workspace.id);
                }
            }
            by_id.insert(workspace.id, workspace);
        }

        Self { workspaces: by_id, pools, by_domain }
    }

    pub fn workspace(&self, id: WorkspaceId) -> Option<&Workspace> {
        self.workspaces.get(&id)
    }

    pub fn workspaces_for_domain(&self, domain: &str) -> &[WorkspaceId] {
        self.by_domain.get(&domain.to_ascii_lowercase()).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn default_pool(&self) -> Option<&Pool> {
        self.pools.iter().find(|p| p.is_default && p.enabled)
    }

    pub fn matching_pools(&self, sender_domain: &str) -> Vec<&Pool> {
        self.pools.iter().filter(|p| p.matches_sender_domain(sender_domain)).collect()
    }
}

pub struct WorkspaceRegistry {
    snapshot: ArcSwap<Snapshot>,
}

impl WorkspaceRegistry {
    /// Loads an initial snapshot synchronously so the caller never sees
    /// an empty registry between process start and the first refresh.
    pub async fn load(
        workspace_store: &dyn WorkspaceStore,
        pool_store: &dyn PoolStore,
    ) -> Result<Arc<Self>, crate::store::StoreError> {
        let snapshot = Self::fetch(workspace_store, pool_store).await?;
        Ok(Arc::new(Self { snapshot: ArcSwap::from_pointee(snapshot) }))
    }

    async fn fetch(
        workspace_store: &dyn WorkspaceStore,
        pool_store: &dyn PoolStore,
    ) -> Result<Snapshot, crate::store::StoreError> {
        let workspaces = workspace_store.list_workspaces().await?;
        let pools = pool_store.list_pools().await?;
        Ok(Snapshot::build(
            workspaces.into_iter().filter(|w| w.validate().is_ok()).collect(),
            pools,
        ))
    }

    pub fn snapshot(&self) -> arc_swap::Guard<Arc<Snapshot>> {
        self.snapshot.load()
    }

    pub fn replace(&self, workspaces: Vec<Workspace>, pools: Vec<Pool>) {
        for workspace in &workspaces {
            if let Err(reason) = workspace.validate() {
                warn!(workspace_id = %workspace.id, %reason, "skipping invalid workspace in registry reload");
            }
        }
        self.snapshot.store(Arc::new(Snapshot::build(
            workspaces.into_iter().filter(|w| w.validate().is_ok()).collect(),
            pools,
        )));
    }

    /// Spawns the background poll loop. Returns when `shutdown` fires.
    pub fn spawn_refresher<F, Fut>(
        self: Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
        load_workspaces: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(Vec<Workspace>, Vec<Pool>), crate::store::StoreError>> + Send,
    {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("workspace registry refresher shutting down");
                        return;
                    }
                    _ = ticker.tick() => {
                        match load_workspaces().await {
                            Ok((workspaces, pools)) => self.replace(workspaces, pools),
                            Err(error) => error!(%error, "failed to refresh workspace registry"),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{ProviderConfig, RateLimits};
    use chrono::Utc;

    fn workspace(domains: Vec<&str>) -> Workspace {
        Workspace {
            id: WorkspaceId::new(),
            display_name: "test".into(),
            domains: domains.into_iter().map(str::to_string).collect(),
            provider: ProviderConfig::Mandrill { api_key: "key".into() },
            limits: RateLimits { daily: 100, hourly: 10, per_user_daily: 10, per_user_hourly: 1, per_user_overrides: Default::default() },
            enabled: true,
            header_rewrites: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn domain_index_is_case_insensitive() {
        let ws = workspace(vec!["Example.com"]);
        let id = ws.id;
        let snapshot = Snapshot::build(vec![ws], Vec::new());

        assert_eq!(snapshot.workspaces_for_domain("example.com"), &[id]);
        assert_eq!(snapshot.workspaces_for_domain("EXAMPLE.COM"), &[id]);
    }

    #[test]
    fn disabled_workspace_is_not_indexed() {
        let mut ws = workspace(vec!["example.com"]);
        ws.enabled = false;
        let snapshot = Snapshot::build(vec![ws], Vec::new());

        assert!(snapshot.workspaces_for_domain("example.com").is_empty());
    }
}
