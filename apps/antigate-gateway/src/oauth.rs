//! Concrete `TokenRefresher` (spec §4 L3) talking to Google's OAuth token
//! endpoint. Grounded on
//! `gproxy-provider-impl::providers::antigravity::oauth::refresh_access_token`
//! and its session-token sibling, reproduced over `wreq` instead of the
//! gproxy's shared provider HTTP client since this binary builds its own.

use async_trait::async_trait;
use serde::Deserialize;

use antigate_core::error::CoreError;
use antigate_core::token_provider::{RefreshedToken, TokenRefresher};

const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// The known Antigravity IDE OAuth client id/secret pair; not a secret in
/// the usual sense (it ships inside the public IDE binary) but kept out of
/// the workspace-dependency-light `antigate-common` crate since it's
/// provider-specific.
const CLIENT_ID: &str = "1071006060591-tmhssin2h21lcre235vtolojh4g403ep.apps.googleusercontent.com";
const CLIENT_SECRET: &str = "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";

pub fn known_client_ids() -> Vec<String> {
    vec![CLIENT_ID.to_string()]
}

pub struct GoogleOAuthRefresher {
    client: wreq::Client,
    token_url: String,
}

impl GoogleOAuthRefresher {
    pub fn new(client: wreq::Client) -> Self {
        Self { client, token_url: DEFAULT_TOKEN_URL.to_string() }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl From<TokenResponse> for RefreshedToken {
    fn from(value: TokenResponse) -> Self {
        RefreshedToken {
            access_token: value.access_token,
            refresh_token: value.refresh_token,
            expires_in_secs: value.expires_in,
        }
    }
}

#[async_trait]
impl TokenRefresher for GoogleOAuthRefresher {
    async fn exchange_session_token(&self, session_token: &str, client_id: &str) -> Result<RefreshedToken, CoreError> {
        // Google's token endpoint does not have a distinct "session token"
        // grant; Antigravity IDE builds exchange it with the same
        // refresh_token grant shape, so this is an alias of
        // `refresh_with_grant` kept as its own trait method because not every
        // provider family shares that equivalence.
        self.refresh_with_grant(session_token, client_id).await
    }

    async fn refresh_with_grant(&self, refresh_token: &str, client_id: &str) -> Result<RefreshedToken, CoreError> {
        let body = format!(
            "refresh_token={}&client_id={}&client_secret={}&grant_type=refresh_token",
            urlencode(refresh_token),
            urlencode(client_id),
            urlencode(CLIENT_SECRET),
        );
        let response = self
            .client
            .post(&self.token_url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|err| CoreError::TokenRefresh(err.to_string()))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| CoreError::TokenRefresh(err.to_string()))?;
        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes);
            return Err(CoreError::TokenRefresh(format!("{status}: {text}")));
        }
        serde_json::from_slice::<TokenResponse>(&bytes)
            .map(RefreshedToken::from)
            .map_err(|err| CoreError::TokenRefresh(err.to_string()))
    }
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
