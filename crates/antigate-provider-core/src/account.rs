//! Account identity and credential shapes. Grounded on
//! `gproxy-provider-core::credential` (`CredentialId`, `Credential`,
//! `CredentialState`), renamed to "account" vocabulary since this engine
//! only ever dispatches to the single Antigravity provider family.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub type AccountId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthCredential {
    pub refresh_token: String,
    pub access_token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub access_token_expires_at: time::OffsetDateTime,
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub label: String,
    pub credential: OAuthCredential,
    /// Relative selection weight for the weighted-random pick in the retry
    /// loop; accounts with more headroom get a higher weight upstream.
    pub weight: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnavailableReason {
    RateLimit,
    Timeout,
    Upstream5xx,
    AuthInvalid,
    ModelDisallow,
    Manual,
    Unknown,
}

#[derive(Debug, Clone)]
pub enum AccountState {
    Active,
    Unavailable {
        until: Instant,
        reason: UnavailableReason,
    },
}

impl AccountState {
    pub fn is_active(&self) -> bool {
        matches!(self, AccountState::Active)
    }

    pub fn unavailable_until(&self) -> Option<Instant> {
        match self {
            AccountState::Unavailable { until, .. } => Some(*until),
            AccountState::Active => None,
        }
    }
}
