//! Inline template token resolution (spec §6): subject/body text may
//! contain `<<NAME>>` or `<<NAME:param1,param2>>` tokens. Resolution is
//! a callback hook so the core never talks to the trending-content
//! service directly — only `TRENDING_QUESTION` is reserved, everything
//! else is caller-defined.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::warn;

pub const TRENDING_QUESTION: &str = "TRENDING_QUESTION";

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<<([A-Z_]+)(?::([^>]*))?>>").expect("token regex is valid"));

/// A parsed `<<NAME>>` / `<<NAME:params>>` occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub name: String,
    pub params: Vec<String>,
}

/// Resolves a single token to its replacement text. Implementations may
/// call out to external services; a per-token failure must never fail
/// the send (spec §6), so this returns `Option` rather than `Result` —
/// `None` leaves the token literal in the output.
#[async_trait]
pub trait TemplateResolver: Send + Sync {
    async fn resolve(&self, token: &Token) -> Option<String>;
}

/// A resolver that never resolves anything, for deployments that don't
/// wire up the trending-content hook.
pub struct NullResolver;

#[async_trait]
impl TemplateResolver for NullResolver {
    async fn resolve(&self, _token: &Token) -> Option<String> {
        None
    }
}

/// Scans `text` for tokens and replaces each one that `resolver`
/// resolves. Tokens the resolver declines (returns `None`) or that fail
/// are left literal.
pub async fn render(text: &str, resolver: &dyn TemplateResolver) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_end = 0;

    for capture in TOKEN.captures_iter(text) {
        let whole = capture.get(0).expect("group 0 always matches");
        out.push_str(&text[last_end..whole.start()]);

        let token = Token {
            name: capture[1].to_string(),
            params: capture
                .get(2)
                .map(|p| p.as_str().split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
                .unwrap_or_default(),
        };

        match resolver.resolve(&token).await {
            Some(replacement) => out.push_str(&replacement),
            None => {
                warn!(token = %token.name, "template token left unresolved");
                out.push_str(whole.as_str());
            }
        }

        last_end = whole.end();
    }
    out.push_str(&text[last_end..]);
    out
}

#[cfg(test)]
mod test {
    use super::*;

    struct EchoResolver;

    #[async_trait]
    impl TemplateResolver for EchoResolver {
        async fn resolve(&self, token: &Token) -> Option<String> {
            if token.name == "SHOUT" {
                Some(token.params.join("-").to_uppercase())
            } else {
                None
            }
        }
    }

    #[tokio::test]
    async fn resolves_known_tokens_and_leaves_unknown_literal() {
        let text = "Hello <<SHOUT:hi,there>>, unresolved: <<TRENDING_QUESTION:topic-1>>";
        let out = render(text, &EchoResolver).await;
        assert_eq!(out, "Hello HI-THERE, unresolved: <<TRENDING_QUESTION:topic-1>>");
    }

    #[tokio::test]
    async fn plain_text_without_tokens_is_unchanged() {
        let out = render("no tokens here", &NullResolver).await;
        assert_eq!(out, "no tokens here");
    }

    #[test]
    fn parses_params() {
        let captures = TOKEN.captures("<<TRENDING_QUESTION:topic-1,user-2>>").unwrap();
        assert_eq!(&captures[1], "TRENDING_QUESTION");
        assert_eq!(&captures[2], "topic-1,user-2");
    }
}
