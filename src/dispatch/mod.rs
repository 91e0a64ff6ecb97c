//! Dispatch Worker Pool (spec §4.7): leases a batch of due messages,
//! selects a workspace/provider via the [`LoadBalancer`], reserves
//! quota, sends through the [`BreakerRegistry`], and drives each
//! message to its next state. Worker concurrency is bounded by a
//! [`tokio::sync::Semaphore`], the same shape the teacher uses to bound
//! concurrent upstream sends.

pub mod backoff;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::balancer::{LoadBalancer, SelectError};
use crate::breaker::BreakerRegistry;
use crate::dispatch::backoff::BackoffConfig;
use crate::error::TerminalOutcome;
use crate::models::{Message, MessageId, ProviderKind, RateScope, Workspace, WorkspaceId};
use crate::providers::{build_adapter, ProviderAdapter, ProviderError, SendRequest};
use crate::rate_limit::{RateLimiter, Reservation};
use crate::registry::WorkspaceRegistry;
use crate::store::MessageStore;
use crate::templating::{self, TemplateResolver};
use crate::webhook::{TerminalEvent, WebhookNotifier};

#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    pub worker_concurrency: usize,
    pub max_batch: usize,
    pub visibility_timeout: Duration,
    pub max_attempts: i32,
    pub poll_interval: Duration,
    pub backoff: BackoffConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 16,
            max_batch: 8,
            visibility_timeout: Duration::from_secs(120),
            max_attempts: 8,
            poll_interval: Duration::from_millis(500),
            backoff: BackoffConfig::default(),
        }
    }
}

/// One worker pool instance. `worker_id` identifies this process/pool
/// to the store's lease bookkeeping; it need not be unique per task,
/// only per running worker pool.
pub struct DispatchWorker {
    worker_id: String,
    config: DispatchConfig,
    message_store: Arc<dyn MessageStore>,
    registry: Arc<WorkspaceRegistry>,
    balancer: Arc<LoadBalancer>,
    rate_limiter: Arc<dyn RateLimiter>,
    breakers: Arc<BreakerRegistry>,
    webhook: Arc<WebhookNotifier>,
    template_resolver: Arc<dyn TemplateResolver>,
    adapters: RwLock<HashMap<WorkspaceId, Arc<dyn ProviderAdapter>>>,
    semaphore: Arc<Semaphore>,
    wakeup: Notify,
}

impl DispatchWorker {
    pub fn new(
        worker_id: String,
        config: DispatchConfig,
        message_store: Arc<dyn MessageStore>,
        registry: Arc<WorkspaceRegistry>,
        balancer: Arc<LoadBalancer>,
        rate_limiter: Arc<dyn RateLimiter>,
        breakers: Arc<BreakerRegistry>,
        webhook: Arc<WebhookNotifier>,
        template_resolver: Arc<dyn TemplateResolver>,
    ) -> Arc<Self> {
        let semaphore = Arc::new(Semaphore::new(config.worker_concurrency));
        Arc::new(Self {
            worker_id,
            config,
            message_store,
            registry,
            balancer,
            rate_limiter,
            breakers,
            webhook,
            template_resolver,
            adapters: RwLock::new(HashMap::new()),
            semaphore,
            wakeup: Notify::new(),
        })
    }

    /// Wakes an idle lease loop immediately, for `POST /api/process`
    /// (spec §6: "trigger immediate lease sweep"). A no-op if a sweep
    /// is already running.
    pub fn trigger_sweep(&self) {
        self.wakeup.notify_one();
    }

    /// Runs the lease/process loop until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }

            let leased = match self.message_store.lease(&self.worker_id, self.config.max_batch, self.config.visibility_timeout).await {
                Ok(messages) => messages,
                Err(error) => {
                    error!(%error, "failed to lease messages, backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = self.wakeup.notified() => {}
                    }
                    continue;
                }
            };

            if leased.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = self.wakeup.notified() => {}
                }
                continue;
            }

            let mut handles = Vec::with_capacity(leased.len());
            for message in leased {
                let Ok(permit) = self.semaphore.clone().acquire_owned().await else { return };
                let this = self.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    this.process(message).await;
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    async fn process(&self, message: Message) {
        let now = Utc::now();
        let snapshot = self.registry.snapshot();
        let sender_email = message.from_email.to_string();

        let selection = match self.balancer.select(&snapshot, &sender_email, now).await {
            Ok(selection) => selection,
            Err(SelectError::NoPool(domain)) => {
                self.reschedule(message.id, self.config.backoff.max, format!("no pool configured for domain {domain}")).await;
                return;
            }
            Err(SelectError::NoCapacity { retry_after }) => {
                let delay = Self::delay_until(retry_after, self.config.backoff.max, now);
                self.reschedule(message.id, delay, "no eligible workspace has capacity".into()).await;
                return;
            }
            Err(error) => {
                error!(message_id = %message.id, %error, "load balancer selection failed");
                self.reschedule(message.id, self.config.backoff.max, error.to_string()).await;
                return;
            }
        };

        let Some(workspace) = snapshot.workspace(selection.workspace_id).cloned() else {
            self.reschedule(message.id, self.config.backoff.max, "selected workspace is no longer in the registry".into()).await;
            return;
        };
        let provider_kind = workspace.provider.kind();

        // Breaker gate (spec §4.7 ordering rule: runs before Reserve so
        // quota is never consumed on a call we already know can't proceed).
        if !self.breakers.allows_request(provider_kind) {
            let next_probe = self.breakers.next_probe_at(provider_kind).unwrap_or(now + chrono::Duration::seconds(30));
            let delay = Self::delay_until(Some(next_probe), self.config.backoff.max, now);
            self.reschedule(message.id, delay, format!("circuit breaker open for {provider_kind:?}")).await;
            return;
        }

        let granted = match self.reserve_quota(&workspace, selection.workspace_id, message.user_id.as_deref(), now).await {
            Ok(granted) => granted,
            Err(retry_after) => {
                let delay = Self::delay_until(Some(retry_after), self.config.backoff.max, now);
                self.reschedule(message.id, delay, "workspace or user quota exhausted".into()).await;
                return;
            }
        };

        let rendered = self.render_message(&message).await;
        let adapter = self.adapter_for(&workspace).await;

        let send_result = self
            .send_with_heartbeat(&message, provider_kind, adapter.as_ref(), SendRequest { message: &rendered, workspace: &workspace })
            .await;

        match send_result {
            Ok(()) => {
                self.complete(&message, TerminalOutcome::Sent, selection.workspace_id, provider_kind, None).await;
            }
            Err(None) => {
                // Breaker tripped between the gate check and the call; Send
                // was never invoked, so give the quota back.
                self.release_quota(selection.workspace_id, &granted, Utc::now()).await;
                let next_probe = self.breakers.next_probe_at(provider_kind).unwrap_or(Utc::now() + chrono::Duration::seconds(30));
                let delay = Self::delay_until(Some(next_probe), self.config.backoff.max, Utc::now());
                self.reschedule(message.id, delay, format!("circuit breaker opened for {provider_kind:?} before send")).await;
            }
            Err(Some(provider_error)) => {
                self.handle_provider_error(&message, selection.workspace_id, provider_kind, provider_error).await;
            }
        }
    }

    /// Wraps a provider send with a periodic lease-heartbeat (spec
    /// §4.7 step 3) and manual breaker gating/recording — manual rather
    /// than [`BreakerRegistry::execute`] because rate-limited responses
    /// must not count as breaker failures (spec §4.7/§4.6).
    async fn send_with_heartbeat<'a>(
        &self,
        message: &Message,
        provider_kind: ProviderKind,
        adapter: &dyn ProviderAdapter,
        request: SendRequest<'a>,
    ) -> Result<(), Option<ProviderError>> {
        if !self.breakers.try_admit(provider_kind) {
            return Err(None);
        }

        let heartbeat_period = self.config.visibility_timeout / 2;
        let mut ticker = tokio::time::interval(heartbeat_period.max(Duration::from_secs(1)));
        ticker.tick().await; // first tick fires immediately; consume it

        let mut send = adapter.send(request);

        let result = loop {
            tokio::select! {
                result = &mut send => break result,
                _ = ticker.tick() => {
                    if let Err(error) = self.message_store.extend_lease(message.id, &self.worker_id, self.config.visibility_timeout).await {
                        warn!(message_id = %message.id, %error, "failed to extend message lease during send");
                    }
                }
            }
        };

        match result {
            Ok(()) => {
                self.breakers.record_success(provider_kind);
                Ok(())
            }
            Err(error) => {
                if error.counts_toward_breaker() {
                    self.breakers.record_failure(provider_kind);
                }
                Err(Some(error))
            }
        }
    }

    async fn handle_provider_error(&self, message: &Message, workspace_id: WorkspaceId, provider_kind: ProviderKind, error: ProviderError) {
        match error {
            ProviderError::Permanent(reason) => {
                self.complete(message, TerminalOutcome::Failed, workspace_id, provider_kind, Some(reason)).await;
            }
            ProviderError::Auth(reason) => {
                self.complete(message, TerminalOutcome::AuthError, workspace_id, provider_kind, Some(reason)).await;
            }
            ProviderError::Transient(reason) => {
                self.retry_or_fail(message, workspace_id, provider_kind, reason, None).await;
            }
            ProviderError::RateLimited { retry_after } => {
                self.retry_or_fail(message, workspace_id, provider_kind, format!("provider rate limited, retry after {retry_after}"), Some(retry_after))
                    .await;
            }
        }
    }

    async fn retry_or_fail(&self, message: &Message, workspace_id: WorkspaceId, provider_kind: ProviderKind, reason: String, provider_retry_after: Option<DateTime<Utc>>) {
        let next_attempt = message.attempt_count + 1;
        if next_attempt >= self.config.max_attempts {
            self.complete(message, TerminalOutcome::Failed, workspace_id, provider_kind, Some(reason)).await;
            return;
        }

        let now = Utc::now();
        let mut delay = self.config.backoff.delay(next_attempt.max(0) as u32);
        if let Some(retry_after) = provider_retry_after {
            delay = delay.max(Self::delay_until(Some(retry_after), self.config.backoff.max, now));
        }
        self.reschedule(message.id, delay, reason).await;
    }

    /// Reserves every applicable counter (workspace daily/hourly, and
    /// user daily/hourly when `user_id` is set) in order, rolling back
    /// whatever was already granted if a later reservation is denied or
    /// errors — the closest approximation of spec §4.2's "single
    /// critical section" reachable with one-counter-at-a-time storage.
    async fn reserve_quota(
        &self,
        workspace: &Workspace,
        workspace_id: WorkspaceId,
        user_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<(RateScope, Option<String>)>, DateTime<Utc>> {
        let (user_daily_limit, user_hourly_limit) = workspace.effective_limit(user_id);
        let mut plan: Vec<(RateScope, Option<String>, i64)> = vec![
            (RateScope::WorkspaceDaily, None, workspace.limits.daily),
            (RateScope::WorkspaceHourly, None, workspace.limits.hourly),
        ];
        if let Some(user) = user_id {
            plan.push((RateScope::UserDaily, Some(user.to_string()), user_daily_limit));
            plan.push((RateScope::UserHourly, Some(user.to_string()), user_hourly_limit));
        }

        let mut granted = Vec::with_capacity(plan.len());
        for (scope, uid, limit) in plan {
            match self.rate_limiter.reserve(scope, workspace_id, uid.as_deref(), limit, now).await {
                Ok(Reservation::Granted) => granted.push((scope, uid)),
                Ok(Reservation::Denied { retry_after }) => {
                    self.release_quota(workspace_id, &granted, now).await;
                    return Err(retry_after);
                }
                Err(error) => {
                    error!(%error, "rate limiter reserve failed");
                    self.release_quota(workspace_id, &granted, now).await;
                    return Err(now + chrono::Duration::seconds(30));
                }
            }
        }
        Ok(granted)
    }

    async fn release_quota(&self, workspace_id: WorkspaceId, granted: &[(RateScope, Option<String>)], now: DateTime<Utc>) {
        for (scope, user_id) in granted {
            if let Err(error) = self.rate_limiter.release(*scope, workspace_id, user_id.as_deref(), now).await {
                warn!(%error, "failed to release rate limit reservation");
            }
        }
    }

    async fn adapter_for(&self, workspace: &Workspace) -> Arc<dyn ProviderAdapter> {
        if let Some(adapter) = self.adapters.read().await.get(&workspace.id) {
            return adapter.clone();
        }
        let mut adapters = self.adapters.write().await;
        adapters.entry(workspace.id).or_insert_with(|| Arc::from(build_adapter(&workspace.provider))).clone()
    }

    async fn render_message(&self, message: &Message) -> Message {
        let mut rendered = message.clone();
        if let Some(subject) = &message.subject {
            rendered.subject = Some(templating::render(subject, self.template_resolver.as_ref()).await);
        }
        if let Some(text) = &message.text_body {
            rendered.text_body = Some(templating::render(text, self.template_resolver.as_ref()).await);
        }
        if let Some(html) = &message.html_body {
            rendered.html_body = Some(templating::render(html, self.template_resolver.as_ref()).await);
        }
        rendered
    }

    async fn complete(
        &self,
        message: &Message,
        outcome: TerminalOutcome,
        workspace_id: WorkspaceId,
        provider_kind: ProviderKind,
        error: Option<String>,
    ) {
        let status = outcome.status();
        let substatus = outcome.substatus().map(str::to_string);

        if let Err(store_error) = self
            .message_store
            .complete(message.id, status, workspace_id, provider_kind, substatus.clone(), error.clone())
            .await
        {
            error!(message_id = %message.id, error = %store_error, "failed to persist terminal status");
            return;
        }

        self.webhook.notify(TerminalEvent {
            message_id: message.id,
            status,
            substatus,
            provider_type: Some(provider_kind),
            attempt_count: message.attempt_count,
            at: Utc::now(),
        });
    }

    async fn reschedule(&self, id: MessageId, delay: Duration, error: String) {
        if let Err(store_error) = self.message_store.reschedule(id, delay, error).await {
            error!(message_id = %id, error = %store_error, "failed to reschedule message");
        }
    }

    fn delay_until(retry_after: Option<DateTime<Utc>>, cap: Duration, now: DateTime<Utc>) -> Duration {
        let Some(retry_after) = retry_after else { return cap };
        (retry_after - now).to_std().unwrap_or(Duration::ZERO).min(cap)
    }
}

/// Periodic lease-reaper (spec §4.1 `reap_expired_leases`): a crashed
/// worker's messages must return to `queued` without an attempt-count
/// bump. Run on a fixed interval alongside the worker pool.
pub async fn run_lease_reaper(message_store: Arc<dyn MessageStore>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                match message_store.reap_expired_leases().await {
                    Ok(0) => {}
                    Ok(n) => info!(count = n, "reaped expired message leases"),
                    Err(error) => error!(%error, "failed to reap expired leases"),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn delay_until_clamps_negative_and_caps_max() {
        let now = Utc::now();
        let cap = Duration::from_secs(60);

        assert_eq!(DispatchWorker::delay_until(None, cap, now), cap);
        assert_eq!(DispatchWorker::delay_until(Some(now - chrono::Duration::seconds(5)), cap, now), Duration::ZERO);
        assert_eq!(
            DispatchWorker::delay_until(Some(now + chrono::Duration::seconds(3600)), cap, now),
            cap
        );
    }
}
