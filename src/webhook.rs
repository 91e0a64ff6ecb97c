//! Webhook Notifier (spec §4.9/§4.9a): at-least-once HTTP POST of
//! terminal message events, HMAC-signed, with bounded retry. Consumes
//! a bounded in-process queue so a slow or down receiver never blocks
//! the dispatch worker that produced the event; under sustained
//! overflow the oldest queued event is dropped in favor of the newest
//! (spec §5 "Webhook: drop-oldest with metric").

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::dispatch::backoff::BackoffConfig;
use crate::models::{MessageId, MessageStatus, ProviderKind};

#[derive(Debug, Clone, Copy)]
pub struct WebhookConfig {
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
    pub queue_capacity: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self { max_attempts: 5, backoff: BackoffConfig::default(), queue_capacity: 1_000 }
    }
}

/// One terminal-state transition, ready to notify. `event_id` is
/// `<message_id>:<status>`, matching spec §4.9's "receivers must be
/// idempotent using event id".
#[derive(Debug, Clone, Serialize)]
pub struct TerminalEvent {
    pub message_id: MessageId,
    pub status: MessageStatus,
    pub substatus: Option<String>,
    pub provider_type: Option<ProviderKind>,
    pub attempt_count: i32,
    pub at: DateTime<Utc>,
}

impl TerminalEvent {
    fn event_id(&self) -> String {
        let status = match self.status {
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
            MessageStatus::Queued | MessageStatus::Processing => "unknown",
        };
        format!("{}:{status}", self.message_id)
    }
}

#[derive(Debug, Error)]
enum WebhookError {
    #[error("receiver returned {0} on every attempt")]
    Exhausted(String),
}

/// A bounded FIFO that drops the oldest entry on overflow rather than
/// rejecting the newest or blocking the producer.
struct EventQueue {
    items: Mutex<VecDeque<TerminalEvent>>,
    capacity: usize,
    notify: Notify,
}

impl EventQueue {
    fn new(capacity: usize) -> Self {
        Self { items: Mutex::new(VecDeque::with_capacity(capacity)), capacity, notify: Notify::new() }
    }

    fn push(&self, event: TerminalEvent) {
        {
            let mut items = self.items.lock().unwrap();
            if items.len() >= self.capacity {
                if let Some(dropped) = items.pop_front() {
                    warn!(message_id = %dropped.message_id, "webhook queue full, dropping oldest event");
                }
            }
            items.push_back(event);
        }
        self.notify.notify_one();
    }

    async fn pop(&self) -> TerminalEvent {
        loop {
            if let Some(event) = self.items.lock().unwrap().pop_front() {
                return event;
            }
            self.notify.notified().await;
        }
    }
}

/// Handle the dispatch worker holds to enqueue terminal events.
/// Delivery happens on a background task spawned by [`WebhookNotifier::spawn`].
pub struct WebhookNotifier {
    queue: Arc<EventQueue>,
}

impl WebhookNotifier {
    pub fn spawn(url: String, secret: String, config: WebhookConfig, shutdown: CancellationToken) -> Arc<Self> {
        let queue = Arc::new(EventQueue::new(config.queue_capacity));
        tokio::spawn(run(url, secret, config, queue.clone(), shutdown));
        Arc::new(Self { queue })
    }

    /// No receiver configured: events are accepted and immediately
    /// discarded rather than spawning a delivery task with nowhere to
    /// send to.
    pub fn disabled() -> Arc<Self> {
        Arc::new(Self { queue: Arc::new(EventQueue::new(0)) })
    }

    pub fn notify(&self, event: TerminalEvent) {
        self.queue.push(event);
    }
}

async fn run(url: String, secret: String, config: WebhookConfig, queue: Arc<EventQueue>, shutdown: CancellationToken) {
    let client = Client::new();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = queue.pop() => event,
        };

        if let Err(error) = deliver(&client, &url, &secret, &config, &event).await {
            error!(message_id = %event.message_id, %error, "webhook delivery exhausted all retries");
        }
    }
}

async fn deliver(
    client: &Client,
    url: &str,
    secret: &str,
    config: &WebhookConfig,
    event: &TerminalEvent,
) -> Result<(), WebhookError> {
    let body = serde_json::to_vec(event).expect("TerminalEvent always serializes");
    let event_id = event.event_id();
    let signature = sign(secret, &body);

    for attempt in 1..=config.max_attempts {
        let result = client
            .post(url)
            .header("X-Event-Id", &event_id)
            .header("X-Signature", &signature)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.clone())
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(response) if response.status().is_client_error() => {
                warn!(message_id = %event.message_id, status = %response.status(), "webhook receiver rejected event, dropping");
                return Ok(());
            }
            Ok(response) if attempt == config.max_attempts => {
                return Err(WebhookError::Exhausted(response.status().to_string()));
            }
            Err(err) if attempt == config.max_attempts => return Err(WebhookError::Exhausted(err.to_string())),
            _ => {}
        }

        tokio::time::sleep(config.backoff.delay(attempt)).await;
    }

    unreachable!("loop always returns by the last attempt")
}

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn event_id_matches_message_id_and_status() {
        let event = TerminalEvent {
            message_id: MessageId::new(),
            status: MessageStatus::Sent,
            substatus: None,
            provider_type: None,
            attempt_count: 1,
            at: Utc::now(),
        };
        assert_eq!(event.event_id(), format!("{}:sent", event.message_id));
    }

    #[test]
    fn signature_is_deterministic_for_same_secret_and_body() {
        let a = sign("s3cret", b"{\"a\":1}");
        let b = sign("s3cret", b"{\"a\":1}");
        assert_eq!(a, b);
        assert_ne!(a, sign("different", b"{\"a\":1}"));
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let queue = EventQueue::new(2);
        let mk = || TerminalEvent { message_id: MessageId::new(), status: MessageStatus::Sent, substatus: None, provider_type: None, attempt_count: 1, at: Utc::now() };
        let (e1, e2, e3) = (mk(), mk(), mk());
        let e3_id = e3.message_id;
        queue.push(e1);
        queue.push(e2.clone());
        queue.push(e3);

        let first = queue.pop().await;
        assert_eq!(first.message_id, e2.message_id);
        let second = queue.pop().await;
        assert_eq!(second.message_id, e3_id);
    }
}
