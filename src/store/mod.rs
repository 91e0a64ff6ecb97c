#[cfg(feature = "postgres-store")]
pub mod postgres;

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{
    Message, MessageFilter, MessageId, MessageStatus, NewMessage, Pool, PoolId, ProviderKind,
    Selection, Workspace, WorkspaceId,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    #[cfg(feature = "postgres-store")]
    Database(#[from] sqlx::Error),
    #[error("message not found")]
    NotFound,
    #[error("pool not found")]
    PoolNotFound,
    #[error("message {0} is currently being processed and cannot be deleted")]
    MessageProcessing(MessageId),
    #[error("{0}")]
    Internal(String),
}

/// The durable queue contract from spec §4.1. Both the Postgres-backed
/// [`postgres::PostgresStore`] and the [`memory::InMemoryStore`] satisfy
/// this trait with identical semantics; only crash-durability differs.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Atomically persists `msg` with status `queued`. Idempotent on
    /// `msg.client_id`: a second call with the same client id returns the
    /// id of the row created by the first call without inserting again.
    async fn enqueue(&self, msg: NewMessage) -> Result<MessageId, StoreError>;

    /// Atomically selects up to `max_batch` queued, due messages, flips
    /// them to `processing`, and sets a lease expiring at
    /// `now + visibility_timeout`. FIFO by `(next_attempt_at, created_at, id)`.
    async fn lease(
        &self,
        worker_id: &str,
        max_batch: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Message>, StoreError>;

    /// Persists a terminal status. `workspace_id`/`provider_type` are the
    /// pair the last attempt was made through, satisfying "once status is
    /// sent|failed, both are non-null" (spec §3) without tracking
    /// per-attempt history on the message row itself.
    async fn complete(
        &self,
        id: MessageId,
        terminal_status: MessageStatus,
        workspace_id: WorkspaceId,
        provider_type: ProviderKind,
        substatus: Option<String>,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    /// Increments `attempt_count`, sets `next_attempt_at = now + delay`,
    /// and returns the message to `queued`.
    async fn reschedule(
        &self,
        id: MessageId,
        delay: Duration,
        error: String,
    ) -> Result<(), StoreError>;

    /// Pushes out an in-flight message's lease expiry, for workers
    /// whose send is taking long enough to risk another worker reaping
    /// it (spec §4.7 step 3, "Heartbeat lease extension for long
    /// sends"). A no-op if the message is no longer leased to
    /// `worker_id` under `processing`.
    async fn extend_lease(
        &self,
        id: MessageId,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<(), StoreError>;

    /// Returns any message whose lease has expired to `queued` without
    /// incrementing `attempt_count` (spec §9 Open Question: the worker
    /// may have crashed mid-call, so this must not count as an attempt).
    /// Returns the number of messages reaped.
    async fn reap_expired_leases(&self) -> Result<u64, StoreError>;

    async fn query(&self, filter: MessageFilter) -> Result<Vec<Message>, StoreError>;

    async fn get(&self, id: MessageId) -> Result<Option<Message>, StoreError>;

    async fn delete(&self, id: MessageId) -> Result<(), StoreError>;

    /// Re-queues a terminal `failed` message for another attempt
    /// (`POST /api/messages/{id}/resend`).
    async fn resend(&self, id: MessageId) -> Result<(), StoreError>;

    async fn status_counts(&self) -> Result<Vec<(MessageStatus, i64)>, StoreError>;

    /// Messages whose `next_attempt_at` is due right now, for the
    /// periodic retry sweep's immediate-wakeup path.
    async fn due_count(&self, at: DateTime<Utc>) -> Result<i64, StoreError>;
}

/// Pool configuration CRUD and the Selection audit log (spec §3/§4.4).
/// Grouped separately from [`MessageStore`] because pool rows change at
/// operator-request rate, not per-message rate.
#[async_trait]
pub trait PoolStore: Send + Sync {
    async fn list_pools(&self) -> Result<Vec<Pool>, StoreError>;
    async fn get_pool(&self, id: PoolId) -> Result<Option<Pool>, StoreError>;
    async fn create_pool(&self, pool: Pool) -> Result<Pool, StoreError>;
    async fn update_pool(&self, pool: Pool) -> Result<Pool, StoreError>;
    async fn delete_pool(&self, id: PoolId) -> Result<(), StoreError>;
    async fn toggle_pool(&self, id: PoolId, enabled: bool) -> Result<Pool, StoreError>;

    /// Increments the pool's round-robin/least-used bookkeeping and
    /// appends a [`Selection`] row. Must be called before the provider
    /// call it audits (spec invariant: "A Selection row is written
    /// before any provider call for that message attempt").
    async fn record_selection(&self, selection: Selection) -> Result<(), StoreError>;

    async fn recent_selections(&self, limit: i64) -> Result<Vec<Selection>, StoreError>;

    /// Count of selections for `workspace_id` within the trailing
    /// `window`, used by the `least_used` strategy.
    async fn selection_count_since(
        &self,
        workspace_id: WorkspaceId,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Advances a pool's round-robin cursor and returns the new value
    /// (mod `member_count`), atomically.
    async fn next_round_robin_index(&self, pool_id: PoolId, member_count: usize) -> Result<usize, StoreError>;
}

/// Workspace configuration CRUD (spec §4.3). Polled by
/// [`crate::registry::WorkspaceRegistry`] on a timer; internal only —
/// workspace records carry live provider credentials and are never
/// exposed through the `/api/*` control-plane surface.
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    async fn list_workspaces(&self) -> Result<Vec<Workspace>, StoreError>;
    async fn get_workspace(&self, id: WorkspaceId) -> Result<Option<Workspace>, StoreError>;
    async fn create_workspace(&self, workspace: Workspace) -> Result<Workspace, StoreError>;
    async fn update_workspace(&self, workspace: Workspace) -> Result<Workspace, StoreError>;
    async fn delete_workspace(&self, id: WorkspaceId) -> Result<(), StoreError>;
}
