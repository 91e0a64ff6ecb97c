//! In-memory [`MessageStore`]/[`PoolStore`] backend. Satisfies the same
//! contracts as [`super::postgres::PostgresStore`] but loses all state on
//! restart, as permitted by spec §4.1 ("the in-memory variant is allowed
//! to lose data on restart").

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    models::{
        Message, MessageFilter, MessageId, MessageStatus, NewMessage, Pool, PoolId, ProviderKind,
        Selection, Workspace, WorkspaceId,
    },
    store::{MessageStore, PoolStore, StoreError, WorkspaceStore},
};

const SELECTION_RETENTION: usize = 10_000;

struct Lease {
    worker_id: String,
    expires_at: DateTime<Utc>,
}

struct StoredMessage {
    message: Message,
    lease: Option<Lease>,
}

#[derive(Default)]
struct Inner {
    messages: HashMap<MessageId, StoredMessage>,
    by_client_id: HashMap<String, MessageId>,
    pools: HashMap<PoolId, Pool>,
    selections: VecDeque<Selection>,
    round_robin_cursors: HashMap<PoolId, usize>,
    selection_history: Vec<(WorkspaceId, DateTime<Utc>)>,
    workspaces: HashMap<WorkspaceId, Workspace>,
}

pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn new_message_from(new: NewMessage, now: DateTime<Utc>) -> Result<Message, StoreError> {
    let from_email = new
        .from_email
        .parse()
        .map_err(|e| StoreError::Internal(format!("invalid from address: {e}")))?;

    Ok(Message {
        id: MessageId::new(),
        client_id: new.client_id,
        from_email,
        recipients: new.recipients,
        headers: new.headers,
        subject: new.subject,
        text_body: new.text_body,
        html_body: new.html_body,
        attachments: new.attachments,
        user_id: new.user_id,
        metadata: new.metadata,
        status: MessageStatus::Queued,
        workspace_id: None,
        provider_type: None,
        attempt_count: 0,
        next_attempt_at: now,
        last_error: None,
        substatus: None,
        created_at: now,
        updated_at: now,
        sent_at: None,
    })
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn enqueue(&self, msg: NewMessage) -> Result<MessageId, StoreError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(client_id) = &msg.client_id
            && let Some(existing) = inner.by_client_id.get(client_id)
        {
            return Ok(*existing);
        }

        let now = Utc::now();
        let client_id = msg.client_id.clone();
        let message = new_message_from(msg, now)?;
        let id = message.id;

        inner.messages.insert(id, StoredMessage { message, lease: None });
        if let Some(client_id) = client_id {
            inner.by_client_id.insert(client_id, id);
        }

        Ok(id)
    }

    async fn lease(
        &self,
        worker_id: &str,
        max_batch: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Message>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();

        let mut candidates: Vec<MessageId> = inner
            .messages
            .values()
            .filter(|m| m.message.status == MessageStatus::Queued && m.message.next_attempt_at <= now)
            .map(|m| m.message.id)
            .collect();

        candidates.sort_by_key(|id| {
            let m = &inner.messages[id].message;
            (m.next_attempt_at, m.created_at, m.id)
        });
        candidates.truncate(max_batch);

        let expires_at = now + chrono::Duration::from_std(visibility_timeout).unwrap_or(chrono::Duration::seconds(30));
        let mut leased = Vec::with_capacity(candidates.len());

        for id in candidates {
            let stored = inner.messages.get_mut(&id).expect("candidate exists");
            stored.message.status = MessageStatus::Processing;
            stored.message.updated_at = now;
            stored.lease = Some(Lease { worker_id: worker_id.to_string(), expires_at });
            leased.push(stored.message.clone());
        }

        Ok(leased)
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
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let stored = inner.messages.get_mut(&id).ok_or(StoreError::NotFound)?;

        stored.message.status = terminal_status;
        stored.message.workspace_id = Some(workspace_id);
        stored.message.provider_type = Some(provider_type);
        stored.message.substatus = substatus;
        stored.message.last_error = error;
        stored.message.updated_at = now;
        if terminal_status == MessageStatus::Sent {
            stored.message.sent_at = Some(now);
        }
        stored.lease = None;

        Ok(())
    }

    async fn reschedule(&self, id: MessageId, delay: Duration, error: String) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let stored = inner.messages.get_mut(&id).ok_or(StoreError::NotFound)?;

        stored.message.attempt_count += 1;
        stored.message.status = MessageStatus::Queued;
        stored.message.next_attempt_at =
            now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        stored.message.last_error = Some(error);
        stored.message.updated_at = now;
        stored.lease = None;

        Ok(())
    }

    async fn extend_lease(&self, id: MessageId, worker_id: &str, visibility_timeout: Duration) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(stored) = inner.messages.get_mut(&id) else { return Ok(()) };

        if stored.message.status == MessageStatus::Processing
            && stored.lease.as_ref().is_some_and(|l| l.worker_id == worker_id)
        {
            let now = Utc::now();
            stored.lease.as_mut().unwrap().expires_at =
                now + chrono::Duration::from_std(visibility_timeout).unwrap_or(chrono::Duration::seconds(30));
        }

        Ok(())
    }

    async fn reap_expired_leases(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let mut reaped = 0u64;

        for stored in inner.messages.values_mut() {
            if stored.message.status != MessageStatus::Processing {
                continue;
            }
            let expired = stored.lease.as_ref().is_none_or(|l| l.expires_at <= now);
            if expired {
                stored.message.status = MessageStatus::Queued;
                stored.message.updated_at = now;
                stored.lease = None;
                reaped += 1;
            }
        }

        Ok(reaped)
    }

    async fn query(&self, filter: MessageFilter) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut messages: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| filter.status.is_none_or(|s| s == m.message.status))
            .map(|m| m.message.clone())
            .collect();

        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let offset = filter.paging.offset.max(0) as usize;
        let limit = filter.paging.limit.max(0) as usize;
        Ok(messages.into_iter().skip(offset).take(limit).collect())
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.messages.get(&id).map(|m| m.message.clone()))
    }

    async fn delete(&self, id: MessageId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.messages.get(&id) {
            None => Err(StoreError::NotFound),
            Some(m) if m.message.status == MessageStatus::Processing => {
                Err(StoreError::MessageProcessing(id))
            }
            Some(_) => {
                inner.messages.remove(&id);
                Ok(())
            }
        }
    }

    async fn resend(&self, id: MessageId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let stored = inner.messages.get_mut(&id).ok_or(StoreError::NotFound)?;

        if stored.message.status != MessageStatus::Failed {
            return Err(StoreError::Internal("only failed messages can be resent".into()));
        }

        stored.message.status = MessageStatus::Queued;
        stored.message.next_attempt_at = now;
        stored.message.last_error = None;
        stored.message.substatus = None;
        stored.message.updated_at = now;

        Ok(())
    }

    async fn status_counts(&self) -> Result<Vec<(MessageStatus, i64)>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut counts: HashMap<MessageStatus, i64> = HashMap::new();
        for stored in inner.messages.values() {
            *counts.entry(stored.message.status).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn due_count(&self, at: DateTime<Utc>) -> Result<i64, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .messages
            .values()
            .filter(|m| m.message.status == MessageStatus::Queued && m.message.next_attempt_at <= at)
            .count() as i64)
    }
}

#[async_trait]
impl PoolStore for InMemoryStore {
    async fn list_pools(&self) -> Result<Vec<Pool>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.pools.values().cloned().collect())
    }

    async fn get_pool(&self, id: PoolId) -> Result<Option<Pool>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.pools.get(&id).cloned())
    }

    async fn create_pool(&self, pool: Pool) -> Result<Pool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.pools.insert(pool.id, pool.clone());
        Ok(pool)
    }

    async fn update_pool(&self, pool: Pool) -> Result<Pool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.pools.contains_key(&pool.id) {
            return Err(StoreError::PoolNotFound);
        }
        inner.pools.insert(pool.id, pool.clone());
        Ok(pool)
    }

    async fn delete_pool(&self, id: PoolId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.pools.remove(&id).ok_or(StoreError::PoolNotFound)?;
        Ok(())
    }

    async fn toggle_pool(&self, id: PoolId, enabled: bool) -> Result<Pool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let pool = inner.pools.get_mut(&id).ok_or(StoreError::PoolNotFound)?;
        pool.enabled = enabled;
        pool.updated_at = Utc::now();
        Ok(pool.clone())
    }

    async fn record_selection(&self, selection: Selection) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(pool) = inner.pools.get_mut(&selection.pool_id) {
            pool.selection_count += 1;
        }
        inner.selection_history.push((selection.workspace_id, selection.selected_at));
        inner.selections.push_back(selection);
        while inner.selections.len() > SELECTION_RETENTION {
            inner.selections.pop_front();
        }

        Ok(())
    }

    async fn recent_selections(&self, limit: i64) -> Result<Vec<Selection>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .selections
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn selection_count_since(
        &self,
        workspace_id: WorkspaceId,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .selection_history
            .iter()
            .filter(|(w, at)| *w == workspace_id && *at >= since)
            .count() as i64)
    }

    async fn next_round_robin_index(&self, pool_id: PoolId, member_count: usize) -> Result<usize, StoreError> {
        if member_count == 0 {
            return Ok(0);
        }
        let mut inner = self.inner.lock().unwrap();
        let cursor = inner.round_robin_cursors.entry(pool_id).or_insert(0);
        let index = *cursor % member_count;
        *cursor = (*cursor + 1) % member_count;
        Ok(index)
    }
}

#[async_trait]
impl WorkspaceStore for InMemoryStore {
    async fn list_workspaces(&self) -> Result<Vec<Workspace>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.workspaces.values().cloned().collect())
    }

    async fn get_workspace(&self, id: WorkspaceId) -> Result<Option<Workspace>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.workspaces.get(&id).cloned())
    }

    async fn create_workspace(&self, workspace: Workspace) -> Result<Workspace, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.workspaces.insert(workspace.id, workspace.clone());
        Ok(workspace)
    }

    async fn update_workspace(&self, workspace: Workspace) -> Result<Workspace, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.workspaces.contains_key(&workspace.id) {
            return Err(StoreError::NotFound);
        }
        inner.workspaces.insert(workspace.id, workspace.clone());
        Ok(workspace)
    }

    async fn delete_workspace(&self, id: WorkspaceId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.workspaces.remove(&id).ok_or(StoreError::NotFound)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::Recipient;

    fn sample_message(client_id: Option<&str>) -> NewMessage {
        NewMessage {
            client_id: client_id.map(str::to_string),
            from_email: "sender@a.test".to_string(),
            recipients: vec![Recipient {
                address: "rcpt@b.test".parse().unwrap(),
                kind: crate::models::RecipientKind::To,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn idempotent_enqueue() {
        let store = InMemoryStore::new();
        let id1 = store.enqueue(sample_message(Some("client-1"))).await.unwrap();
        let id2 = store.enqueue(sample_message(Some("client-1"))).await.unwrap();
        assert_eq!(id1, id2);

        let all = store.query(MessageFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn lease_is_mutually_exclusive_and_fifo() {
        let store = InMemoryStore::new();
        store.enqueue(sample_message(None)).await.unwrap();
        store.enqueue(sample_message(None)).await.unwrap();

        let batch_a = store.lease("worker-a", 8, Duration::from_secs(30)).await.unwrap();
        assert_eq!(batch_a.len(), 2);

        // already leased: a second lease call sees nothing queued
        let batch_b = store.lease("worker-b", 8, Duration::from_secs(30)).await.unwrap();
        assert!(batch_b.is_empty());
    }

    #[tokio::test]
    async fn reap_does_not_bump_attempt_count() {
        let store = InMemoryStore::new();
        let id = store.enqueue(sample_message(None)).await.unwrap();
        store.lease("worker-a", 8, Duration::from_millis(0)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let reaped = store.reap_expired_leases().await.unwrap();
        assert_eq!(reaped, 1);

        let msg = store.get(id).await.unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Queued);
        assert_eq!(msg.attempt_count, 0);

        // idempotent: a second reap finds nothing left to reap
        assert_eq!(store.reap_expired_leases().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reschedule_increments_attempt_count() {
        let store = InMemoryStore::new();
        let id = store.enqueue(sample_message(None)).await.unwrap();
        store.lease("worker-a", 8, Duration::from_secs(30)).await.unwrap();

        store
            .reschedule(id, Duration::from_secs(1), "transient".to_string())
            .await
            .unwrap();

        let msg = store.get(id).await.unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Queued);
        assert_eq!(msg.attempt_count, 1);
    }

    #[tokio::test]
    async fn round_robin_cursor_wraps() {
        let store = InMemoryStore::new();
        let pool_id = PoolId::new();
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(store.next_round_robin_index(pool_id, 3).await.unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 0, 1]);
    }
}
