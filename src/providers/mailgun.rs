use reqwest::multipart::Form;
use reqwest::Client;

use crate::providers::{classify_status, resolved_headers, ProviderAdapter, ProviderError, SendRequest};

pub struct MailgunAdapter {
    client: Client,
    api_key: String,
    domain: String,
    base_url: String,
}

impl MailgunAdapter {
    pub fn new(api_key: String, domain: String, base_url: String) -> Self {
        Self { client: Client::new(), api_key, domain, base_url }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for MailgunAdapter {
    async fn send(&self, request: SendRequest<'_>) -> Result<(), ProviderError> {
        let message = request.message;
        let url = format!("{}/v3/{}/messages", self.base_url.trim_end_matches('/'), self.domain);

        let mut form = Form::new()
            .text("from", message.from_email.to_string())
            .text(
                "to",
                message.to_addresses().into_iter().map(|a| a.to_string()).collect::<Vec<_>>().join(","),
            );

        if let Some(subject) = &message.subject {
            form = form.text("subject", subject.clone());
        }
        if let Some(text) = &message.text_body {
            form = form.text("text", text.clone());
        }
        if let Some(html) = &message.html_body {
            form = form.text("html", html.clone());
        }
        for (name, value) in resolved_headers(message, request.workspace) {
            form = form.text(format!("h:{name}"), value);
        }
        for attachment in &message.attachments {
            let part = reqwest::multipart::Part::bytes(attachment.content.clone())
                .file_name(attachment.filename.clone())
                .mime_str(&attachment.content_type)
                .map_err(|e| ProviderError::Permanent(format!("invalid attachment content type: {e}")))?;
            form = form.part("attachment", part);
        }

        let response = self
            .client
            .post(url)
            .basic_auth("api", Some(&self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("mailgun request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after.as_deref(), &body))
    }
}
