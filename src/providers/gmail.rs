//! Gmail adapter: server-to-server service-account impersonation (JWT
//! bearer grant, RFC 7523), not the interactive OAuth consent flow —
//! there is no user in the loop, so this stays inside the in-scope
//! Provider Adapters component rather than the out-of-scope "OAuth
//! consent flows" collaborator.
//!
//! The RSA signing step reuses this crate's DKIM key-handling pattern
//! (`aws_lc_rs::signature`), just for a JWT assertion instead of a
//! `DKIM-Signature` header.

use std::sync::RwLock;

use aws_lc_rs::rand::SystemRandom;
use aws_lc_rs::signature::{RsaKeyPair, RSA_PKCS1_SHA256};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::providers::{build_mime_message, classify_status, ProviderAdapter, ProviderError, SendRequest};

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const SCOPE: &str = "https://www.googleapis.com/auth/gmail.send";
const TOKEN_SAFETY_MARGIN: Duration = Duration::seconds(60);

#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

pub struct GmailAdapter {
    client: Client,
    service_account_json: String,
    impersonate_user: String,
    cached_token: RwLock<Option<CachedToken>>,
}

impl GmailAdapter {
    pub fn new(service_account_json: String, impersonate_user: String) -> Self {
        Self {
            client: Client::new(),
            service_account_json,
            impersonate_user,
            cached_token: RwLock::new(None),
        }
    }

    fn cached_valid_token(&self) -> Option<String> {
        let cached = self.cached_token.read().unwrap();
        cached
            .as_ref()
            .filter(|t| t.expires_at - TOKEN_SAFETY_MARGIN > Utc::now())
            .map(|t| t.access_token.clone())
    }

    fn sign_assertion(&self, key: &ServiceAccountKey) -> Result<String, ProviderError> {
        let now = Utc::now();
        let header = serde_json::json!({"alg": "RS256", "typ": "JWT"});
        let claims = serde_json::json!({
            "iss": key.client_email,
            "sub": self.impersonate_user,
            "scope": SCOPE,
            "aud": TOKEN_URL,
            "iat": now.timestamp(),
            "exp": (now + Duration::minutes(30)).timestamp(),
        });

        let signing_input = format!(
            "{}.{}",
            Base64UrlUnpadded::encode_string(header.to_string().as_bytes()),
            Base64UrlUnpadded::encode_string(claims.to_string().as_bytes()),
        );

        let pkcs8 = rustls_pemfile::pkcs8_private_keys(&mut key.private_key.as_bytes())
            .next()
            .ok_or_else(|| ProviderError::Auth("gmail service account key has no PKCS8 private key".into()))?
            .map_err(|e| ProviderError::Auth(format!("malformed gmail service account key: {e}")))?;

        let keypair = RsaKeyPair::from_pkcs8(pkcs8.secret_pkcs8_der())
            .map_err(|_| ProviderError::Auth("gmail service account key could not be parsed".into()))?;

        let rng = SystemRandom::new();
        let mut signature = vec![0u8; keypair.public_modulus_len()];
        keypair
            .sign(&RSA_PKCS1_SHA256, &rng, signing_input.as_bytes(), &mut signature)
            .map_err(|_| ProviderError::Auth("failed to sign gmail JWT assertion".into()))?;

        Ok(format!("{signing_input}.{}", Base64UrlUnpadded::encode_string(&signature)))
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        if let Some(token) = self.cached_valid_token() {
            return Ok(token);
        }

        let key: ServiceAccountKey = serde_json::from_str(&self.service_account_json)
            .map_err(|e| ProviderError::Auth(format!("invalid gmail service account JSON: {e}")))?;
        let assertion = self.sign_assertion(&key)?;

        let response = self
            .client
            .post(TOKEN_URL)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("gmail token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, None, &body));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("gmail token response malformed: {e}")))?;

        *self.cached_token.write().unwrap() = Some(CachedToken {
            access_token: token.access_token.clone(),
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
        });

        Ok(token.access_token)
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for GmailAdapter {
    async fn send(&self, request: SendRequest<'_>) -> Result<(), ProviderError> {
        let token = self.access_token().await?;

        let raw = build_mime_message(request.message, request.workspace)
            .map_err(|e| ProviderError::Permanent(format!("failed to build MIME message: {e}")))?;
        let raw_b64 = Base64UrlUnpadded::encode_string(&raw);

        let url = format!(
            "https://gmail.googleapis.com/gmail/v1/users/{}/messages/send",
            self.impersonate_user
        );

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&serde_json::json!({ "raw": raw_b64 }))
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("gmail send request failed: {e}")))?;

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
