//! Core error vocabulary and the sanitizer every client-facing error body
//! passes through before it leaves this engine.
//!
//! Grounded on `gproxy-core::error::ProxyError`, trimmed to the dispatch
//! engine's own failure surface (HTTP request parsing/routing is out of
//! scope and lives in the collaborator that calls into this crate).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("no base url is currently reachable")]
    NoUrlAvailable,
    #[error("account pool exhausted: {0}")]
    AccountPoolExhausted(#[from] antigate_provider_core::AcquireError),
    #[error("provider error: {0}")]
    Provider(#[from] antigate_provider_core::ProviderError),
    #[error("upstream transport failure: {0}")]
    Transport(String),
    #[error("upstream returned {status}: {body}")]
    UpstreamStatus { status: u16, body: String },
    #[error("idempotency key conflict")]
    KeyConflict,
    #[error("token refresh failed: {0}")]
    TokenRefresh(String),
    #[error("{0}")]
    Other(String),
}

/// Scrubs credentials and internal base URLs out of an upstream error body
/// before it is attached to a client-facing response or journal entry that
/// might be echoed back. Matches on the vocabulary the token provider and
/// base-url list actually use, not a generic secret-detector.
pub fn sanitize_upstream_body(body: &str, internal_urls: &[String]) -> String {
    let mut sanitized = body.to_string();
    for url in internal_urls {
        if !url.is_empty() {
            sanitized = sanitized.replace(url.as_str(), "[redacted-url]");
        }
    }
    sanitize_tokens(&sanitized)
}

fn sanitize_tokens(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;
    for marker in ["access_token", "refresh_token", "Bearer "] {
        if let Some(pos) = rest.find(marker) {
            out.push_str(&rest[..pos]);
            out.push_str(marker);
            out.push_str("[redacted]");
            let after = &rest[pos + marker.len()..];
            rest = match after.find(['"', '\n', ' ']) {
                Some(end) => &after[end..],
                None => "",
            };
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_known_internal_urls() {
        let urls = vec!["https://internal.upstream.example/v1".to_string()];
        let body = r#"{"error":"failed calling https://internal.upstream.example/v1"}"#;
        let sanitized = sanitize_upstream_body(body, &urls);
        assert!(!sanitized.contains("internal.upstream.example"));
        assert!(sanitized.contains("[redacted-url]"));
    }

    #[test]
    fn redacts_bearer_and_refresh_token_values() {
        let body = r#"{"authorization":"Bearer abcdef123","refresh_token":"rt-secret-value"}"#;
        let sanitized = sanitize_upstream_body(body, &[]);
        assert!(!sanitized.contains("abcdef123"));
        assert!(!sanitized.contains("rt-secret-value"));
    }
}
