//! Pluggable SMTP authentication policy (spec §4.8): a trusted-network
//! deployment can accept mail anonymously, while a public-facing one
//! requires `AUTH PLAIN`/`LOGIN` verified against a caller-supplied
//! callback.

use std::collections::HashMap;

use async_trait::async_trait;

/// Checks a username/password pair. Implementations own their own
/// credential store; the session never sees anything but the bool.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, username: &str, password: &str) -> Option<String>;
}

/// Verifier backed by a static, in-process username → password-hash
/// table (`password-auth`), for deployments that don't wire their own
/// user store.
pub struct StaticVerifier {
    credentials: HashMap<String, String>,
}

impl StaticVerifier {
    pub fn new(credentials: HashMap<String, String>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl AuthVerifier for StaticVerifier {
    async fn verify(&self, username: &str, password: &str) -> Option<String> {
        let hash = self.credentials.get(username)?;
        password_auth::verify_password(password.as_bytes(), hash)
            .ok()
            .map(|()| username.to_string())
    }
}

/// Decides whether a session must authenticate before `MAIL FROM` is
/// accepted.
pub enum AuthPolicy {
    /// Trusted network (e.g. an internal sidecar): no AUTH exchange
    /// required, sessions proceed straight to MAIL FROM.
    Anonymous,
    /// Public listener: `AUTH PLAIN`/`LOGIN` must succeed against
    /// `verifier` first.
    Required(std::sync::Arc<dyn AuthVerifier>),
}

impl AuthPolicy {
    pub fn requires_auth(&self) -> bool {
        matches!(self, AuthPolicy::Required(_))
    }

    pub async fn verify(&self, username: &str, password: &str) -> Option<String> {
        match self {
            AuthPolicy::Anonymous => Some(username.to_string()),
            AuthPolicy::Required(verifier) => verifier.verify(username, password).await,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn static_verifier_accepts_matching_password() {
        let mut credentials = HashMap::new();
        credentials.insert("john".to_string(), password_auth::generate_hash(b"p4ssw0rd"));
        let verifier = StaticVerifier::new(credentials);

        assert_eq!(verifier.verify("john", "p4ssw0rd").await, Some("john".to_string()));
        assert_eq!(verifier.verify("john", "wrong").await, None);
        assert_eq!(verifier.verify("nobody", "p4ssw0rd").await, None);
    }

    #[tokio::test]
    async fn anonymous_policy_never_rejects() {
        let policy = AuthPolicy::Anonymous;
        assert!(!policy.requires_auth());
        assert_eq!(policy.verify("anyone", "").await, Some("anyone".to_string()));
    }
}
