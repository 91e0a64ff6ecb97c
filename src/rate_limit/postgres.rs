use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{RateScope, WorkspaceId};
use crate::rate_limit::{RateLimitError, RateLimiter, Reservation, Usage};

#[derive(Debug, Clone)]
pub struct PostgresRateLimiter {
    pool: PgPool,
}

impl PostgresRateLimiter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateLimiter for PostgresRateLimiter {
    async fn reserve(
        &self,
        scope: RateScope,
        workspace_id: WorkspaceId,
        user_id: Option<&str>,
        limit: i64,
        at: DateTime<Utc>,
    ) -> Result<Reservation, RateLimitError> {
        let bucket_start = scope.window().bucket_start(at);
        let user_key = user_id.unwrap_or("");

        // UPSERT then conditionally increment under row lock: two
        // concurrent reservations against the same bucket serialize on
        // the row, so neither can push `count` past `limit`.
        let row = sqlx::query!(
            r#"
            INSERT INTO rate_counters (scope, workspace_id, user_id, bucket_start, count)
            VALUES ($1, $2, $3, $4, 0)
            ON CONFLICT (scope, workspace_id, user_id, bucket_start) DO NOTHING
            "#,
            scope as _,
            workspace_id.as_uuid(),
            user_key,
            bucket_start,
        )
        .execute(&self.pool)
        .await?;
        drop(row);

        let granted = sqlx::query_scalar!(
            r#"
            UPDATE rate_counters
            SET count = count + 1
            WHERE scope = $1 AND workspace_id = $2 AND user_id = $3 AND bucket_start = $4 AND count < $5
            RETURNING true as "granted!"
            "#,
            scope as _,
            workspace_id.as_uuid(),
            user_key,
            bucket_start,
            limit,
        )
        .fetch_optional(&self.pool)
        .await?;

        if granted.is_some() {
            Ok(Reservation::Granted)
        } else {
            Ok(Reservation::Denied { retry_after: scope.window().bucket_end(bucket_start) })
        }
    }

    async fn release(
        &self,
        scope: RateScope,
        workspace_id: WorkspaceId,
        user_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), RateLimitError> {
        let bucket_start = scope.window().bucket_start(at);
        let user_key = user_id.unwrap_or("");

        sqlx::query!(
            r#"
            UPDATE rate_counters
            SET count = greatest(count - 1, 0)
            WHERE scope = $1 AND workspace_id = $2 AND user_id = $3 AND bucket_start = $4
            "#,
            scope as _,
            workspace_id.as_uuid(),
            user_key,
            bucket_start,
        )
        .execute(&self.pool)
        .await?;

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
        let bucket_start = scope.window().bucket_start(at);
        let user_key = user_id.unwrap_or("");

        let count = sqlx::query_scalar!(
            r#"
            SELECT count FROM rate_counters
            WHERE scope = $1 AND workspace_id = $2 AND user_id = $3 AND bucket_start = $4
            "#,
            scope as _,
            workspace_id.as_uuid(),
            user_key,
            bucket_start,
        )
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or(0);

        Ok(Usage {
            scope,
            bucket_start,
            bucket_end: scope.window().bucket_end(bucket_start),
            count,
            limit,
        })
    }
}
