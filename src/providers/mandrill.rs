use base64ct::{Base64, Encoding};
use reqwest::Client;
use serde::Serialize;

use crate::providers::{classify_status, resolved_headers, ProviderAdapter, ProviderError, SendRequest};

const SEND_URL: &str = "https://mandrillapp.com/api/1.0/messages/send";

#[derive(Serialize)]
struct MandrillAddress {
    email: String,
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct MandrillAttachment {
    #[serde(rename = "type")]
    content_type: String,
    name: String,
    content: String,
}

#[derive(Serialize)]
struct MandrillMessage {
    from_email: String,
    to: Vec<MandrillAddress>,
    subject: Option<String>,
    text: Option<String>,
    html: Option<String>,
    headers: std::collections::BTreeMap<String, String>,
    attachments: Vec<MandrillAttachment>,
}

#[derive(Serialize)]
struct SendBody {
    key: String,
    message: MandrillMessage,
}

pub struct MandrillAdapter {
    client: Client,
    api_key: String,
}

impl MandrillAdapter {
    pub fn new(api_key: String) -> Self {
        Self { client: Client::new(), api_key }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for MandrillAdapter {
    async fn send(&self, request: SendRequest<'_>) -> Result<(), ProviderError> {
        let message = request.message;

        let body = SendBody {
            key: self.api_key.clone(),
            message: MandrillMessage {
                from_email: message.from_email.to_string(),
                to: message
                    .to_addresses()
                    .into_iter()
                    .map(|a| MandrillAddress { email: a.to_string(), kind: "to" })
                    .collect(),
                subject: message.subject.clone(),
                text: message.text_body.clone(),
                html: message.html_body.clone(),
                headers: resolved_headers(message, request.workspace).into_iter().collect(),
                attachments: message
                    .attachments
                    .iter()
                    .map(|a| MandrillAttachment {
                        content_type: a.content_type.clone(),
                        name: a.filename.clone(),
                        content: Base64::encode_string(&a.content),
                    })
                    .collect(),
            },
        };

        let response = self
            .client
            .post(SEND_URL)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("mandrill request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body_text = response.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after.as_deref(), &body_text))
    }
}
