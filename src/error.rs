use thiserror::Error;

use crate::{models::MessageStatus, providers::ProviderError, store::StoreError};

/// Top-level error taxonomy for the dispatch pipeline (spec §7).
///
/// Every variant maps to exactly one propagation outcome: an SMTP reply
/// code at intake, or a reschedule/terminal decision inside a worker.
/// Never add a variant without also updating that mapping.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StoreError),
    #[error("quota exceeded, retry after {retry_after:?}")]
    QuotaExceeded { retry_after: chrono::DateTime<chrono::Utc> },
    #[error("no eligible provider for this sender domain")]
    NoEligibleProvider { retry_after: Option<chrono::DateTime<chrono::Utc>> },
    #[error("provider call failed transiently: {0}")]
    ProviderTransient(String),
    #[error("provider rejected the message permanently: {0}")]
    ProviderPermanent(String),
    #[error("provider credentials are invalid: {0}")]
    ProviderAuth(String),
    #[error("circuit breaker open, next probe at {next_probe_at}")]
    BreakerOpen { next_probe_at: chrono::DateTime<chrono::Utc> },
    #[error("operation timed out")]
    Timeout,
    #[error("operation cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ProviderError> for DispatchError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Transient(msg) => DispatchError::ProviderTransient(msg),
            ProviderError::Permanent(msg) => DispatchError::ProviderPermanent(msg),
            ProviderError::RateLimited { retry_after } => {
                DispatchError::ProviderTransient(format!(
                    "rate limited by provider, retry after {retry_after}"
                ))
            }
            ProviderError::Auth(msg) => DispatchError::ProviderAuth(msg),
        }
    }
}

/// The terminal/substatus pairing surfaced to the dashboard for a failed
/// or auth-errored delivery attempt (spec §7: "Dashboard distinguishes
/// `failed` from `auth_error`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalOutcome {
    Sent,
    Failed,
    AuthError,
}

impl TerminalOutcome {
    pub fn status(self) -> MessageStatus {
        match self {
            TerminalOutcome::Sent => MessageStatus::Sent,
            TerminalOutcome::Failed | TerminalOutcome::AuthError => MessageStatus::Failed,
        }
    }

    pub fn substatus(self) -> Option<&'static str> {
        match self {
            TerminalOutcome::AuthError => Some("auth_error"),
            _ => None,
        }
    }
}
