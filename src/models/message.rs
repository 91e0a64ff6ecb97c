use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use email_address::EmailAddress;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::{MessageId, ProviderKind, WorkspaceId};

/// Lifecycle status of a `Message` (spec §3). `Sent` and `Failed` are
/// absorbing — once reached, a message never transitions again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres-store", sqlx(type_name = "message_status", rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Queued,
    Processing,
    Sent,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RecipientKind {
    To,
    Cc,
    Bcc,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct Recipient {
    #[schema(value_type = String)]
    pub address: EmailAddress,
    pub kind: RecipientKind,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    #[serde(skip_serializing)]
    #[schema(write_only)]
    pub content: Vec<u8>,
}

impl Attachment {
    pub fn size_bytes(&self) -> usize {
        self.content.len()
    }
}

/// A single queued/processing/terminal message (spec §3).
///
/// `workspace_id` and `provider_type` are `None` until a worker selects a
/// pool member for this message's first attempt; the invariant "once
/// status is sent|failed, both are non-null" is enforced by
/// [`crate::dispatch`], not by this type — the store does not reject
/// writes that would violate it, since that would require a check
/// constraint per backend and the in-memory backend has none.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct Message {
    pub id: MessageId,
    /// Caller-supplied idempotency key. A unique index on this column
    /// backs the "idempotent enqueue" law from spec §8.
    pub client_id: Option<String>,
    #[schema(value_type = String)]
    pub from_email: EmailAddress,
    pub recipients: Vec<Recipient>,
    /// Ordered multi-map: header names may repeat (e.g. `Received`).
    pub headers: Vec<(String, String)>,
    pub subject: Option<String>,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub attachments: Vec<Attachment>,
    pub user_id: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub status: MessageStatus,
    pub workspace_id: Option<WorkspaceId>,
    pub provider_type: Option<ProviderKind>,
    pub attempt_count: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Non-`None` only when `status == Failed` and the failure was a
    /// provider auth rejection (spec §7); lets the dashboard tell
    /// "failed" apart from "auth_error" without a new top-level status.
    pub substatus: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn to_addresses(&self) -> Vec<&EmailAddress> {
        self.recipients
            .iter()
            .filter(|r| matches!(r.kind, RecipientKind::To))
            .map(|r| &r.address)
            .collect()
    }

    pub fn all_addresses(&self) -> impl Iterator<Item = &EmailAddress> {
        self.recipients.iter().map(|r| &r.address)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, MessageStatus::Sent | MessageStatus::Failed)
    }
}

/// What the SMTP frontend hands the store on `Enqueue` (spec §4.1).
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub client_id: Option<String>,
    pub from_email: String,
    pub recipients: Vec<Recipient>,
    pub headers: Vec<(String, String)>,
    pub subject: Option<String>,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub attachments: Vec<Attachment>,
    pub user_id: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Deserialize, utoipa::IntoParams)]
#[serde(default)]
#[into_params(parameter_in = Query)]
pub struct Paging {
    pub offset: i64,
    pub limit: i64,
}

impl Default for Paging {
    fn default() -> Self {
        Self { offset: 0, limit: 100 }
    }
}

#[derive(Debug, Clone, Default, Deserialize, utoipa::IntoParams)]
#[serde(default)]
#[into_params(parameter_in = Query)]
pub struct MessageFilter {
    pub status: Option<MessageStatus>,
    #[serde(flatten)]
    #[param(inline)]
    pub paging: Paging,
}

/// Kept for dashboard display only — not part of the message row.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryAttempt {
    pub attempt: i32,
    pub workspace_id: WorkspaceId,
    pub provider_type: ProviderKind,
    pub outcome: String,
    pub at: DateTime<Utc>,
}
