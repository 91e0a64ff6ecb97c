//! Postgres-backed [`MessageStore`]/[`PoolStore`], gated behind the
//! `postgres-store` feature. Follows the repository-per-aggregate shape
//! of the message/organization repositories this crate grew out of:
//! a thin wrapper around a `PgPool`, `query!`/`query_as!` against a
//! migrated schema, `RETURNING` for round-trips.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};

use crate::models::{
    HeaderRewriteRule, Message, MessageFilter, MessageId, MessageStatus, NewMessage, Pool, PoolId,
    ProviderConfig, ProviderKind, RateLimits, Recipient, Selection, SelectionStrategy, Workspace,
    WorkspaceId,
};
use crate::store::{MessageStore, PoolStore, StoreError, WorkspaceStore};

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_attachments(
        &self,
        ids: &[MessageId],
    ) -> Result<HashMap<MessageId, Vec<crate::models::Attachment>>, StoreError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let uuids: Vec<uuid::Uuid> = ids.iter().map(|id| id.as_uuid()).collect();

        let rows = sqlx::query!(
            r#"
            SELECT message_id, filename, content_type, content
            FROM message_attachments
            WHERE message_id = ANY($1)
            ORDER BY message_id, idx
            "#,
            &uuids,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_message: HashMap<MessageId, Vec<crate::models::Attachment>> = HashMap::new();
        for row in rows {
            by_message
                .entry(MessageId::from(row.message_id))
                .or_default()
                .push(crate::models::Attachment {
                    filename: row.filename,
                    content_type: row.content_type,
                    content: row.content,
                });
        }
        Ok(by_message)
    }

    async fn attach_attachments(&self, message: &mut Message) -> Result<(), StoreError> {
        let mut loaded = self.load_attachments(&[message.id]).await?;
        message.attachments = loaded.remove(&message.id).unwrap_or_default();
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: uuid::Uuid,
    client_id: Option<String>,
    from_email: String,
    recipients: Json<Vec<Recipient>>,
    headers: Json<Vec<(String, String)>>,
    subject: Option<String>,
    text_body: Option<String>,
    html_body: Option<String>,
    user_id: Option<String>,
    metadata: Json<BTreeMap<String, serde_json::Value>>,
    status: MessageStatus,
    workspace_id: Option<uuid::Uuid>,
    provider_type: Option<ProviderKind>,
    attempt_count: i32,
    next_attempt_at: DateTime<Utc>,
    last_error: Option<String>,
    substatus: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            id: MessageId::from(row.id),
            client_id: row.client_id,
            from_email: row
                .from_email
                .parse()
                .map_err(|e| StoreError::Internal(format!("corrupt from_email in row: {e}")))?,
            recipients: row.recipients.0,
            headers: row.headers.0,
            subject: row.subject,
            text_body: row.text_body,
            html_body: row.html_body,
            attachments: Vec::new(),
            user_id: row.user_id,
            metadata: row.metadata.0,
            status: row.status,
            workspace_id: row.workspace_id.map(WorkspaceId::from),
            provider_type: row.provider_type,
            attempt_count: row.attempt_count,
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
            substatus: row.substatus,
            created_at: row.created_at,
            updated_at: row.updated_at,
            sent_at: row.sent_at,
        })
    }
}

// Plain column list: this constant is spliced into SQL run through the
// runtime `query_as` (not the `query_as!` macro), so decoding is driven
// entirely by `MessageRow`'s field types via `#[derive(sqlx::FromRow)]` —
// no inline `as "col: Type"` casts here.
const MESSAGE_COLUMNS: &str = r#"
    id, client_id, from_email, recipients, headers, subject, text_body, html_body,
    user_id, metadata, status, workspace_id, provider_type, attempt_count,
    next_attempt_at, last_error, substatus, created_at, updated_at, sent_at
"#;

#[async_trait]
impl MessageStore for PostgresStore {
    async fn enqueue(&self, msg: NewMessage) -> Result<MessageId, StoreError> {
        if let Some(client_id) = &msg.client_id {
            let existing = sqlx::query_scalar!(
                "SELECT id FROM messages WHERE client_id = $1",
                client_id
            )
            .fetch_optional(&self.pool)
            .await?;
            if let Some(id) = existing {
                return Ok(MessageId::from(id));
            }
        }

        let recipients = Json(msg.recipients);
        let headers = Json(msg.headers);
        let metadata = Json(msg.metadata);

        let id = sqlx::query_scalar!(
            r#"
            INSERT INTO messages
                (id, client_id, from_email, recipients, headers, subject, text_body,
                 html_body, user_id, metadata, status, next_attempt_at)
            VALUES
                (gen_random_uuid(), $1, $2, $3, $4, $5, $6, $7, $8, $9, 'queued', now())
            ON CONFLICT (client_id) WHERE client_id IS NOT NULL DO NOTHING
            RETURNING id
            "#,
            msg.client_id,
            msg.from_email,
            recipients as _,
            headers as _,
            msg.subject,
            msg.text_body,
            msg.html_body,
            msg.user_id,
            metadata as _,
        )
        .fetch_optional(&self.pool)
        .await?;

        let id = match id {
            Some(id) => id,
            None => {
                // Lost the race against a concurrent enqueue with the same client_id.
                let client_id = msg.client_id.as_deref().expect("ON CONFLICT target implies client_id");
                sqlx::query_scalar!("SELECT id FROM messages WHERE client_id = $1", client_id)
                    .fetch_one(&self.pool)
                    .await?
            }
        };

        Ok(MessageId::from(id))
    }

    async fn lease(
        &self,
        worker_id: &str,
        max_batch: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Message>, StoreError> {
        let visibility_secs = visibility_timeout.as_secs() as f64;
        let limit = max_batch as i64;

        let query = format!(
            r#"
            WITH due AS (
                SELECT id FROM messages
                WHERE status = 'queued' AND next_attempt_at <= now()
                ORDER BY next_attempt_at, created_at, id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE messages m
            SET status = 'processing',
                updated_at = now(),
                leased_by = $2,
                lease_expires_at = now() + make_interval(secs => $3)
            FROM due
            WHERE m.id = due.id
            RETURNING {MESSAGE_COLUMNS}
            "#
        );

        let rows: Vec<MessageRow> = sqlx::query_as(&query)
            .bind(limit)
            .bind(worker_id)
            .bind(visibility_secs)
            .fetch_all(&self.pool)
            .await?;

        let ids: Vec<MessageId> = rows.iter().map(|r| MessageId::from(r.id)).collect();
        let mut attachments = self.load_attachments(&ids).await?;

        rows.into_iter()
            .map(|row| {
                let id = MessageId::from(row.id);
                let mut message = Message::try_from(row)?;
                message.attachments = attachments.remove(&id).unwrap_or_default();
                Ok(message)
            })
            .collect()
    }

    async fn complete(
        &self,
        id: MessageId,
        terminal_status: MessageStatus,
        workspace_id: WorkspaceId,
        provider_type: ProviderKind,
        substatus: Option<String>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let sent_at_clause = matches!(terminal_status, MessageStatus::Sent);

        let result = sqlx::query!(
            r#"
            UPDATE messages
            SET status = $2::message_status,
                workspace_id = $3,
                provider_type = $4,
                substatus = $5,
                last_error = $6,
                updated_at = now(),
                sent_at = CASE WHEN $7 THEN now() ELSE sent_at END,
                leased_by = NULL,
                lease_expires_at = NULL
            WHERE id = $1
            "#,
            id.as_uuid(),
            terminal_status as _,
            workspace_id.as_uuid(),
            provider_type as _,
            substatus,
            error,
            sent_at_clause,
        )
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn reschedule(&self, id: MessageId, delay: Duration, error: String) -> Result<(), StoreError> {
        let delay_secs = delay.as_secs() as f64;

        let result = sqlx::query!(
            r#"
            UPDATE messages
            SET status = 'queued',
                attempt_count = attempt_count + 1,
                next_attempt_at = now() + make_interval(secs => $2),
                last_error = $3,
                updated_at = now(),
                leased_by = NULL,
                lease_expires_at = NULL
            WHERE id = $1
            "#,
            id.as_uuid(),
            delay_secs,
            error,
        )
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn extend_lease(&self, id: MessageId, worker_id: &str, visibility_timeout: Duration) -> Result<(), StoreError> {
        let visibility_secs = visibility_timeout.as_secs() as f64;

        sqlx::query!(
            r#"
            UPDATE messages
            SET lease_expires_at = now() + make_interval(secs => $3)
            WHERE id = $1 AND leased_by = $2 AND status = 'processing'
            "#,
            id.as_uuid(),
            worker_id,
            visibility_secs,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reap_expired_leases(&self) -> Result<u64, StoreError> {
        let result = sqlx::query!(
            r#"
            UPDATE messages
            SET status = 'queued',
                updated_at = now(),
                leased_by = NULL,
                lease_expires_at = NULL
            WHERE status = 'processing' AND (lease_expires_at IS NULL OR lease_expires_at <= now())
            "#
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn query(&self, filter: MessageFilter) -> Result<Vec<Message>, StoreError> {
        let query = format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE ($1::message_status IS NULL OR status = $1)
            ORDER BY created_at DESC
            OFFSET $2
            LIMIT $3
            "#
        );

        let rows: Vec<MessageRow> = sqlx::query_as(&query)
            .bind(filter.status)
            .bind(filter.paging.offset)
            .bind(filter.paging.limit)
            .fetch_all(&self.pool)
            .await?;

        let ids: Vec<MessageId> = rows.iter().map(|r| MessageId::from(r.id)).collect();
        let mut attachments = self.load_attachments(&ids).await?;

        rows.into_iter()
            .map(|row| {
                let id = MessageId::from(row.id);
                let mut message = Message::try_from(row)?;
                message.attachments = attachments.remove(&id).unwrap_or_default();
                Ok(message)
            })
            .collect()
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        let query = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1");

        let row: Option<MessageRow> = sqlx::query_as(&query)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let mut message = Message::try_from(row)?;
                self.attach_attachments(&mut message).await?;
                Ok(Some(message))
            }
        }
    }

    async fn delete(&self, id: MessageId) -> Result<(), StoreError> {
        let result = sqlx::query!(
            "DELETE FROM messages WHERE id = $1 AND status != 'processing'",
            id.as_uuid(),
        )
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let still_there = sqlx::query_scalar!("SELECT 1 FROM messages WHERE id = $1", id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
            return Err(match still_there {
                Some(_) => StoreError::MessageProcessing(id),
                None => StoreError::NotFound,
            });
        }
        Ok(())
    }

    async fn resend(&self, id: MessageId) -> Result<(), StoreError> {
        let result = sqlx::query!(
            r#"
            UPDATE messages
            SET status = 'queued',
                next_attempt_at = now(),
                last_error = NULL,
                substatus = NULL,
                updated_at = now()
            WHERE id = $1 AND status = 'failed'
            "#,
            id.as_uuid(),
        )
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Internal("only failed messages can be resent".into()));
        }
        Ok(())
    }

    async fn status_counts(&self) -> Result<Vec<(MessageStatus, i64)>, StoreError> {
        let rows = sqlx::query!(
            r#"SELECT status as "status: MessageStatus", count(*) as "count!" FROM messages GROUP BY status"#
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| (r.status, r.count)).collect())
    }

    async fn due_count(&self, at: DateTime<Utc>) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar!(
            r#"SELECT count(*) as "count!" FROM messages WHERE status = 'queued' AND next_attempt_at <= $1"#,
            at,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

struct PoolRow {
    id: uuid::Uuid,
    name: String,
    domain_patterns: Vec<String>,
    strategy: SelectionStrategy,
    enabled: bool,
    is_default: bool,
    weights: Json<BTreeMap<WorkspaceId, u32>>,
    selection_count: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PoolRow {
    async fn into_pool(self, store: &PostgresStore) -> Result<Pool, StoreError> {
        let members = sqlx::query_scalar!(
            "SELECT workspace_id FROM pool_members WHERE pool_id = $1 ORDER BY position",
            self.id,
        )
        .fetch_all(&store.pool)
        .await?;

        Ok(Pool {
            id: PoolId::from(self.id),
            name: self.name,
            domain_patterns: self.domain_patterns,
            member_workspace_ids: members.into_iter().map(WorkspaceId::from).collect(),
            strategy: self.strategy,
            enabled: self.enabled,
            is_default: self.is_default,
            weights: self.weights.0,
            selection_count: self.selection_count,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[async_trait]
impl PoolStore for PostgresStore {
    async fn list_pools(&self) -> Result<Vec<Pool>, StoreError> {
        let rows = sqlx::query_as!(
            PoolRow,
            r#"
            SELECT id, name, domain_patterns, strategy as "strategy: SelectionStrategy",
                   enabled, is_default, weights as "weights: Json<BTreeMap<WorkspaceId, u32>>",
                   selection_count, created_at, updated_at
            FROM pools
            ORDER BY name
            "#
        )
        .fetch_all(&self.pool)
        .await?;

        let mut pools = Vec::with_capacity(rows.len());
        for row in rows {
            pools.push(row.into_pool(self).await?);
        }
        Ok(pools)
    }

    async fn get_pool(&self, id: PoolId) -> Result<Option<Pool>, StoreError> {
        let row = sqlx::query_as!(
            PoolRow,
            r#"
            SELECT id, name, domain_patterns, strategy as "strategy: SelectionStrategy",
                   enabled, is_default, weights as "weights: Json<BTreeMap<WorkspaceId, u32>>",
                   selection_count, created_at, updated_at
            FROM pools
            WHERE id = $1
            "#,
            id.as_uuid(),
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some(row) => Ok(Some(row.into_pool(self).await?)),
        }
    }

    async fn create_pool(&self, pool: Pool) -> Result<Pool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let weights = Json(pool.weights.clone());

        sqlx::query!(
            r#"
            INSERT INTO pools (id, name, domain_patterns, strategy, enabled, is_default, weights, selection_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
            pool.id.as_uuid(),
            pool.name,
            &pool.domain_patterns,
            pool.strategy as _,
            pool.enabled,
            pool.is_default,
            weights as _,
            pool.selection_count,
        )
        .execute(&mut *tx)
        .await?;

        for (position, workspace_id) in pool.member_workspace_ids.iter().enumerate() {
            sqlx::query!(
                "INSERT INTO pool_members (pool_id, workspace_id, position) VALUES ($1, $2, $3)",
                pool.id.as_uuid(),
                workspace_id.as_uuid(),
                position as i32,
            )
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(pool)
    }

    async fn update_pool(&self, pool: Pool) -> Result<Pool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let weights = Json(pool.weights.clone());

        let result = sqlx::query!(
            r#"
            UPDATE pools
            SET name = $2, domain_patterns = $3, strategy = $4, enabled = $5,
                is_default = $6, weights = $7, updated_at = now()
            WHERE id = $1
            "#,
            pool.id.as_uuid(),
            pool.name,
            &pool.domain_patterns,
            pool.strategy as _,
            pool.enabled,
            pool.is_default,
            weights as _,
        )
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::PoolNotFound);
        }

        sqlx::query!("DELETE FROM pool_members WHERE pool_id = $1", pool.id.as_uuid())
            .execute(&mut *tx)
            .await?;
        for (position, workspace_id) in pool.member_workspace_ids.iter().enumerate() {
            sqlx::query!(
                "INSERT INTO pool_members (pool_id, workspace_id, position) VALUES ($1, $2, $3)",
                pool.id.as_uuid(),
                workspace_id.as_uuid(),
                position as i32,
            )
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(pool)
    }

    async fn delete_pool(&self, id: PoolId) -> Result<(), StoreError> {
        let result = sqlx::query!("DELETE FROM pools WHERE id = $1", id.as_uuid())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::PoolNotFound);
        }
        Ok(())
    }

    async fn toggle_pool(&self, id: PoolId, enabled: bool) -> Result<Pool, StoreError> {
        let result = sqlx::query!(
            "UPDATE pools SET enabled = $2, updated_at = now() WHERE id = $1",
            id.as_uuid(),
            enabled,
        )
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::PoolNotFound);
        }
        self.get_pool(id).await?.ok_or(StoreError::PoolNotFound)
    }

    async fn record_selection(&self, selection: Selection) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query!(
            "UPDATE pools SET selection_count = selection_count + 1 WHERE id = $1",
            selection.pool_id.as_uuid(),
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query!(
            r#"
            INSERT INTO selections (pool_id, workspace_id, strategy_used, sender_email, selected_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
            selection.pool_id.as_uuid(),
            selection.workspace_id.as_uuid(),
            selection.strategy_used as _,
            selection.sender_email,
            selection.selected_at,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn recent_selections(&self, limit: i64) -> Result<Vec<Selection>, StoreError> {
        let rows = sqlx::query!(
            r#"
            SELECT pool_id, workspace_id, strategy_used as "strategy_used: SelectionStrategy",
                   sender_email, selected_at
            FROM selections
            ORDER BY selected_at DESC
            LIMIT $1
            "#,
            limit,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Selection {
                pool_id: PoolId::from(r.pool_id),
                workspace_id: WorkspaceId::from(r.workspace_id),
                strategy_used: r.strategy_used,
                sender_email: r.sender_email,
                selected_at: r.selected_at,
            })
            .collect())
    }

    async fn selection_count_since(
        &self,
        workspace_id: WorkspaceId,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar!(
            r#"SELECT count(*) as "count!" FROM selections WHERE workspace_id = $1 AND selected_at >= $2"#,
            workspace_id.as_uuid(),
            since,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn next_round_robin_index(&self, pool_id: PoolId, member_count: usize) -> Result<usize, StoreError> {
        if member_count == 0 {
            return Ok(0);
        }

        let previous = sqlx::query_scalar!(
            r#"
            UPDATE pools
            SET round_robin_cursor = round_robin_cursor + 1
            WHERE id = $1
            RETURNING round_robin_cursor - 1 as "previous!"
            "#,
            pool_id.as_uuid(),
        )
        .fetch_one(&self.pool)
        .await?;

        Ok((previous.rem_euclid(member_count as i64)) as usize)
    }
}

struct WorkspaceRow {
    id: uuid::Uuid,
    display_name: String,
    domains: Vec<String>,
    provider: Json<ProviderConfig>,
    limits: Json<RateLimits>,
    enabled: bool,
    header_rewrites: Json<Vec<HeaderRewriteRule>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<WorkspaceRow> for Workspace {
    fn from(row: WorkspaceRow) -> Self {
        Workspace {
            id: WorkspaceId::from(row.id),
            display_name: row.display_name,
            domains: row.domains,
            provider: row.provider.0,
            limits: row.limits.0,
            enabled: row.enabled,
            header_rewrites: row.header_rewrites.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[async_trait]
impl WorkspaceStore for PostgresStore {
    async fn list_workspaces(&self) -> Result<Vec<Workspace>, StoreError> {
        let rows = sqlx::query_as!(
            WorkspaceRow,
            r#"
            SELECT id, display_name, domains, provider as "provider: Json<ProviderConfig>",
                   limits as "limits: Json<RateLimits>", enabled,
                   header_rewrites as "header_rewrites: Json<Vec<HeaderRewriteRule>>",
                   created_at, updated_at
            FROM workspaces
            ORDER BY display_name
            "#
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Workspace::from).collect())
    }

    async fn get_workspace(&self, id: WorkspaceId) -> Result<Option<Workspace>, StoreError> {
        let row = sqlx::query_as!(
            WorkspaceRow,
            r#"
            SELECT id, display_name, domains, provider as "provider: Json<ProviderConfig>",
                   limits as "limits: Json<RateLimits>", enabled,
                   header_rewrites as "header_rewrites: Json<Vec<HeaderRewriteRule>>",
                   created_at, updated_at
            FROM workspaces
            WHERE id = $1
            "#,
            id.as_uuid(),
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Workspace::from))
    }

    async fn create_workspace(&self, workspace: Workspace) -> Result<Workspace, StoreError> {
        let provider = Json(&workspace.provider);
        let limits = Json(&workspace.limits);
        let header_rewrites = Json(&workspace.header_rewrites);

        sqlx::query!(
            r#"
            INSERT INTO workspaces (id, display_name, domains, provider, limits, enabled, header_rewrites)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
            workspace.id.as_uuid(),
            workspace.display_name,
            &workspace.domains,
            provider as _,
            limits as _,
            workspace.enabled,
            header_rewrites as _,
        )
        .execute(&self.pool)
        .await?;

        Ok(workspace)
    }

    async fn update_workspace(&self, workspace: Workspace) -> Result<Workspace, StoreError> {
        let provider = Json(&workspace.provider);
        let limits = Json(&workspace.limits);
        let header_rewrites = Json(&workspace.header_rewrites);

        let result = sqlx::query!(
            r#"
            UPDATE workspaces
            SET display_name = $2, domains = $3, provider = $4, limits = $5,
                enabled = $6, header_rewrites = $7, updated_at = now()
            WHERE id = $1
            "#,
            workspace.id.as_uuid(),
            workspace.display_name,
            &workspace.domains,
            provider as _,
            limits as _,
            workspace.enabled,
            header_rewrites as _,
        )
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(workspace)
    }

    async fn delete_workspace(&self, id: WorkspaceId) -> Result<(), StoreError> {
        let result = sqlx::query!("DELETE FROM workspaces WHERE id = $1", id.as_uuid())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}
