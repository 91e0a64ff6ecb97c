//! Provider adapters (spec §4.6): translate an already-selected
//! [`Message`] + [`Workspace`] pair into exactly one outbound API call,
//! and classify the response into the taxonomy the dispatch worker acts
//! on (retryable vs terminal vs breaker-worthy).

pub mod gmail;
pub mod mailgun;
pub mod mandrill;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_builder::MessageBuilder;
use thiserror::Error;

use crate::models::{Message, ProviderConfig, Workspace};

/// What a send attempt did, from the adapter's point of view. Distinct
/// from [`crate::error::TerminalOutcome`]: this is per-attempt, that is
/// per-message.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network/5xx/timeout — safe to retry, counts toward the breaker.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// 4xx other than auth/rate-limit — message is permanently undeliverable.
    #[error("permanent provider error: {0}")]
    Permanent(String),
    /// 429 or an explicit provider-reported throttle.
    #[error("provider rate limited, retry after {retry_after}")]
    RateLimited { retry_after: DateTime<Utc> },
    /// 401/403 — credentials are bad. Terminal for the message, but
    /// distinguished in `substatus` so operators can tell it apart from
    /// a content-related permanent failure.
    #[error("provider auth error: {0}")]
    Auth(String),
}

impl ProviderError {
    /// Whether this outcome should count as a breaker failure (spec
    /// §4.7: "rate-limited responses do not count as breaker failures —
    /// they reflect the caller's pace, not the endpoint's health").
    pub fn counts_toward_breaker(&self) -> bool {
        !matches!(self, ProviderError::RateLimited { .. })
    }
}

pub struct SendRequest<'a> {
    pub message: &'a Message,
    pub workspace: &'a Workspace,
}

/// One outbound-API binding. Implementations own their own HTTP client
/// and any credential cache (e.g. Gmail's short-lived OAuth token).
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn send(&self, request: SendRequest<'_>) -> Result<(), ProviderError>;
}

/// Builds the adapter matching a workspace's configured provider. Each
/// adapter is stateful (token caches, connection pools) so this is
/// called once per workspace at registry-load time, not per message.
pub fn build_adapter(config: &ProviderConfig) -> Box<dyn ProviderAdapter> {
    match config {
        ProviderConfig::Gmail { service_account_json, impersonate_user } => {
            Box::new(gmail::GmailAdapter::new(service_account_json.clone(), impersonate_user.clone()))
        }
        ProviderConfig::Mailgun { api_key, domain, base_url } => {
            Box::new(mailgun::MailgunAdapter::new(api_key.clone(), domain.clone(), base_url.clone()))
        }
        ProviderConfig::Mandrill { api_key } => Box::new(mandrill::MandrillAdapter::new(api_key.clone())),
    }
}

/// Applies a workspace's header-rewrite policy (spec §4.6) to a
/// message's headers: existing headers matching a rule's name are
/// replaced, and rules with no matching incoming header are appended
/// (e.g. a workspace configured to add a `List-Unsubscribe` header to
/// messages that don't send one). Shared by every adapter so the policy
/// is applied uniformly regardless of wire format.
pub(crate) fn resolved_headers(message: &Message, workspace: &Workspace) -> Vec<(String, String)> {
    let mut resolved = Vec::with_capacity(message.headers.len() + workspace.header_rewrites.len());
    let mut applied = std::collections::HashSet::new();

    for (name, value) in &message.headers {
        if let Some(rule) = workspace.header_rewrites.iter().find(|r| r.header_name.eq_ignore_ascii_case(name)) {
            applied.insert(rule.header_name.to_ascii_lowercase());
            resolved.push((name.clone(), rule.replacement.clone()));
        } else {
            resolved.push((name.clone(), value.clone()));
        }
    }

    for rule in &workspace.header_rewrites {
        if applied.insert(rule.header_name.to_ascii_lowercase()) {
            resolved.push((rule.header_name.clone(), rule.replacement.clone()));
        }
    }

    resolved
}

/// Assembles an RFC 5322 message from a [`Message`], applying the
/// workspace's header rewrites. Used by adapters that take a raw MIME
/// blob rather than structured fields (currently Gmail).
pub(crate) fn build_mime_message(message: &Message, workspace: &Workspace) -> std::io::Result<Vec<u8>> {
    let mut builder = MessageBuilder::new()
        .from(message.from_email.to_string())
        .to(message.to_addresses().into_iter().map(|a| a.to_string()).collect::<Vec<_>>());

    if let Some(subject) = &message.subject {
        builder = builder.subject(subject.clone());
    }
    if let Some(text) = &message.text_body {
        builder = builder.text_body(text.clone());
    }
    if let Some(html) = &message.html_body {
        builder = builder.html_body(html.clone());
    }
    for attachment in &message.attachments {
        builder = builder.attachment(attachment.content_type.clone(), attachment.filename.clone(), attachment.content.clone());
    }

    for (name, value) in resolved_headers(message, workspace) {
        builder = builder.header(name, mail_builder::headers::raw::Raw::new(value));
    }

    builder.write_to_vec()
}

/// Shared classification for reqwest-based adapters: maps a response
/// status to the taxonomy above. `retry_after` is parsed from the
/// `Retry-After` header when present, else defaults to one minute out.
pub(crate) fn classify_status(status: reqwest::StatusCode, retry_after_header: Option<&str>, body: &str) -> ProviderError {
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return ProviderError::Auth(format!("{status}: {body}"));
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = retry_after_header
            .and_then(|v| v.parse::<i64>().ok())
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs))
            .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(60));
        return ProviderError::RateLimited { retry_after };
    }
    if status.is_server_error() {
        return ProviderError::Transient(format!("{status}: {body}"));
    }
    ProviderError::Permanent(format!("{status}: {body}"))
}
