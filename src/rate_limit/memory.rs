use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{RateScope, WorkspaceId};
use crate::rate_limit::{RateLimitError, RateLimiter, Reservation, Usage};

type CounterKey = (RateScope, WorkspaceId, String, DateTime<Utc>);

#[derive(Default)]
pub struct InMemoryRateLimiter {
    counters: Mutex<HashMap<CounterKey, i64>>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(scope: RateScope, workspace_id: WorkspaceId, user_id: Option<&str>, at: DateTime<Utc>) -> CounterKey {
        let bucket_start = scope.window().bucket_start(at);
        (scope, workspace_id, user_id.unwrap_or("").to_string(), bucket_start)
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn reserve(
        &self,
        scope: RateScope,
        workspace_id: WorkspaceId,
        user_id: Option<&str>,
        limit: i64,
        at: DateTime<Utc>,
    ) -> Result<Reservation, RateLimitError> {
        let key = Self::key(scope, workspace_id, user_id, at);
        let mut counters = self.counters.lock().unwrap();
        let count = counters.entry(key).or_insert(0);

        if *count >= limit {
            let bucket_start = scope.window().bucket_start(at);
            return Ok(Reservation::Denied { retry_after: scope.window().bucket_end(bucket_start) });
        }

        *count += 1;
        Ok(Reservation::Granted)
    }

    async fn release(
        &self,
        scope: RateScope,
        workspace_id: WorkspaceId,
        user_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), RateLimitError> {
        let key = Self::key(scope, workspace_id, user_id, at);
        let mut counters = self.counters.lock().unwrap();
        if let Some(count) = counters.get_mut(&key) {
            *count = (*count - 1).max(0);
        }
        Ok(())
    }

    async fn usage(
        &self,
        scope: RateScope,
        workspace_id: WorkspaceId,
        user_id: Option<&str>,
        limit: i64,
        at: DateTime<Utc>,
    ) -> Result<Usage, RateLimitError> {
        let key = Self::key(scope, workspace_id, user_id, at);
        let counters = self.counters.lock().unwrap();
        let count = counters.get(&key).copied().unwrap_or(0);
        let bucket_start = scope.window().bucket_start(at);

        Ok(Usage {
            scope,
            bucket_start,
            bucket_end: scope.window().bucket_end(bucket_start),
            count,
            limit,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn reserve_denies_once_limit_reached() {
        let limiter = InMemoryRateLimiter::new();
        let workspace_id = WorkspaceId::new();
        let now = Utc::now();

        for _ in 0..3 {
            let res = limiter
                .reserve(RateScope::WorkspaceDaily, workspace_id, None, 3, now)
                .await
                .unwrap();
            assert_eq!(res, Reservation::Granted);
        }

        let denied = limiter
            .reserve(RateScope::WorkspaceDaily, workspace_id, None, 3, now)
            .await
            .unwrap();
        assert!(matches!(denied, Reservation::Denied { .. }));
    }

    #[tokio::test]
    async fn release_gives_capacity_back() {
        let limiter = InMemoryRateLimiter::new();
        let workspace_id = WorkspaceId::new();
        let now = Utc::now();

        limiter.reserve(RateScope::UserHourly, workspace_id, Some("u1"), 1, now).await.unwrap();
        let denied = limiter.reserve(RateScope::UserHourly, workspace_id, Some("u1"), 1, now).await.unwrap();
        assert!(matches!(denied, Reservation::Denied { .. }));

        limiter.release(RateScope::UserHourly, workspace_id, Some("u1"), now).await.unwrap();
        let granted = limiter.reserve(RateScope::UserHourly, workspace_id, Some("u1"), 1, now).await.unwrap();
        assert_eq!(granted, Reservation::Granted);
    }

    #[tokio::test]
    async fn release_does_not_go_negative() {
        let limiter = InMemoryRateLimiter::new();
        let workspace_id = WorkspaceId::new();
        let now = Utc::now();

        limiter.release(RateScope::WorkspaceHourly, workspace_id, None, now).await.unwrap();
        let usage = limiter.usage(RateScope::WorkspaceHourly, workspace_id, None, 10, now).await.unwrap();
        assert_eq!(usage.count, 0);
    }
}
