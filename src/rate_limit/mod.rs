//! Quota enforcement (spec §4.2). A [`RateLimiter`] reserves capacity
//! against the four counter families before a provider call and releases
//! it back if the call never happens — the same reserve/release shape
//! the dispatch worker uses for its semaphore permits.

#[cfg(feature = "postgres-store")]
pub mod postgres;

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::models::{RateScope, WorkspaceId};

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("database error: {0}")]
    #[cfg(feature = "postgres-store")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Internal(String),
}

/// The outcome of a reservation attempt against one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// Capacity was available and has been consumed.
    Granted,
    /// The bucket is at or over its limit; retry no sooner than `retry_after`.
    Denied { retry_after: DateTime<Utc> },
}

/// One workspace/user's standing against its configured limits (spec
/// §4.2 / §6 `/api/rate-limit`).
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Usage {
    pub scope: RateScope,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub count: i64,
    pub limit: i64,
}

impl Usage {
    pub fn remaining(&self) -> i64 {
        (self.limit - self.count).max(0)
    }

    pub fn exhausted(&self) -> bool {
        self.count >= self.limit
    }
}

/// Backend for the four rate-counter families. Implementations must make
/// `reserve` atomic: concurrent callers against the same bucket must
/// never together exceed `limit` (spec §8: "no counter ever overshoots
/// its configured limit, even under concurrent reservation").
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Attempts to consume one unit of capacity from the bucket
    /// containing `at` for `(scope, workspace_id, user_id)`, atomically
    /// checked against `limit`. `user_id` is `None` for workspace-scoped
    /// scopes and must be `Some` for user-scoped scopes.
    async fn reserve(
        &self,
        scope: RateScope,
        workspace_id: WorkspaceId,
        user_id: Option<&str>,
        limit: i64,
        at: DateTime<Utc>,
    ) -> Result<Reservation, RateLimitError>;

    /// Gives back a unit reserved in error (spec §4.2: "Release ... used
    /// only when a Reserve succeeds but the attempt is abandoned before
    /// any provider call is made"). Never goes negative.
    async fn release(
        &self,
        scope: RateScope,
        workspace_id: WorkspaceId,
        user_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), RateLimitError>;

    async fn usage(
        &self,
        scope: RateScope,
        workspace_id: WorkspaceId,
        user_id: Option<&str>,
        limit: i64,
        at: DateTime<Utc>,
    ) -> Result<Usage, RateLimitError>;
}
