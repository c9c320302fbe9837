//! Token Provider (spec §2 L3): keeps each account's access token fresh for
//! the forward orchestrator, without the orchestrator knowing whether that
//! meant "nothing to do", "exchanged a session token", or "used the refresh
//! token grant".
//!
//! Grounded on `gproxy-provider-impl::providers::antigravity::oauth`'s
//! `refresh_access_token`/`on_auth_failure`, generalized from that module's
//! single hardcoded client id to a list of candidates tried in order, since
//! this engine dispatches against more than one known Antigravity client
//! build.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use time::OffsetDateTime;

use antigate_provider_core::{AccountId, OAuthCredential};

use crate::error::CoreError;

/// Access tokens within this long of their `expires_at` are treated as
/// stale and refreshed eagerly, rather than being handed out and risking
/// expiry mid-flight on a long-running request.
pub const MIN_FRESHNESS: Duration = Duration::from_secs(2 * 60);

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshedToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, rename = "expires_in")]
    pub expires_in_secs: Option<u64>,
}

impl RefreshedToken {
    fn expires_in(&self) -> Duration {
        Duration::from_secs(self.expires_in_secs.unwrap_or(3600))
    }
}

/// Talks to the upstream OAuth token endpoint. Implemented over the shared
/// upstream HTTP client in production; stubbed in tests.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn exchange_session_token(
        &self,
        session_token: &str,
        client_id: &str,
    ) -> Result<RefreshedToken, CoreError>;

    async fn refresh_with_grant(
        &self,
        refresh_token: &str,
        client_id: &str,
    ) -> Result<RefreshedToken, CoreError>;
}

/// Bypasses the refresh lifecycle entirely when the deployment supplies
/// tokens out of band (e.g. a sidecar credential broker).
#[async_trait]
pub trait ExternalTokenSource: Send + Sync {
    async fn token_for(&self, account_id: AccountId) -> Option<String>;
}

/// Where a refreshed credential gets written back to. The orchestrator
/// supplies the main store (the account's row of record) and, optionally,
/// an auxiliary store (e.g. a cache) that is updated best-effort.
#[async_trait]
pub trait CredentialSink: Send + Sync {
    async fn persist(&self, account_id: AccountId, credential: &OAuthCredential) -> Result<(), CoreError>;
}

pub struct TokenProvider {
    refresher: Arc<dyn TokenRefresher>,
    external: Option<Arc<dyn ExternalTokenSource>>,
    main_store: Arc<dyn CredentialSink>,
    auxiliary_store: Option<Arc<dyn CredentialSink>>,
    candidate_client_ids: Vec<String>,
}

impl TokenProvider {
    pub fn new(
        refresher: Arc<dyn TokenRefresher>,
        main_store: Arc<dyn CredentialSink>,
        candidate_client_ids: Vec<String>,
    ) -> Self {
        Self {
            refresher,
            external: None,
            main_store,
            auxiliary_store: None,
            candidate_client_ids,
        }
    }

    pub fn with_external_source(mut self, source: Arc<dyn ExternalTokenSource>) -> Self {
        self.external = Some(source);
        self
    }

    pub fn with_auxiliary_store(mut self, store: Arc<dyn CredentialSink>) -> Self {
        self.auxiliary_store = Some(store);
        self
    }

    /// Returns a bearer-ready access token, refreshing and persisting the
    /// credential in place if it was stale.
    pub async fn access_token(
        &self,
        account_id: AccountId,
        credential: &mut OAuthCredential,
        session_token: Option<&str>,
    ) -> Result<String, CoreError> {
        if let Some(external) = &self.external
            && let Some(token) = external.token_for(account_id).await
        {
            return Ok(token);
        }

        let now = OffsetDateTime::now_utc();
        if credential.access_token_expires_at - now > MIN_FRESHNESS {
            return Ok(credential.access_token.clone());
        }

        let refreshed = self.refresh(credential, session_token).await?;
        credential.access_token = refreshed.access_token.clone();
        if let Some(refresh_token) = &refreshed.refresh_token {
            credential.refresh_token = refresh_token.clone();
        }
        credential.access_token_expires_at = now + refreshed.expires_in();

        let _ = self.main_store.persist(account_id, credential).await;
        if let Some(aux) = &self.auxiliary_store {
            let _ = aux.persist(account_id, credential).await;
        }

        Ok(refreshed.access_token)
    }

    async fn refresh(
        &self,
        credential: &OAuthCredential,
        session_token: Option<&str>,
    ) -> Result<RefreshedToken, CoreError> {
        if let Some(session_token) = session_token {
            for client_id in &self.candidate_client_ids {
                if let Ok(refreshed) = self.refresher.exchange_session_token(session_token, client_id).await {
                    return Ok(refreshed);
                }
            }
        }

        for client_id in &self.candidate_client_ids {
            if let Ok(refreshed) = self
                .refresher
                .refresh_with_grant(&credential.refresh_token, client_id)
                .await
            {
                return Ok(refreshed);
            }
        }

        Err(CoreError::TokenRefresh(
            "every candidate client id was rejected by the token endpoint".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct StubRefresher {
        accepted_client_id: &'static str,
    }

    #[async_trait]
    impl TokenRefresher for StubRefresher {
        async fn exchange_session_token(
            &self,
            _session_token: &str,
            client_id: &str,
        ) -> Result<RefreshedToken, CoreError> {
            if client_id == self.accepted_client_id {
                Ok(RefreshedToken {
                    access_token: "from-session".into(),
                    refresh_token: None,
                    expires_in_secs: Some(3600),
                })
            } else {
                Err(CoreError::TokenRefresh("rejected client id".into()))
            }
        }

        async fn refresh_with_grant(
            &self,
            _refresh_token: &str,
            client_id: &str,
        ) -> Result<RefreshedToken, CoreError> {
            if client_id == self.accepted_client_id {
                Ok(RefreshedToken {
                    access_token: "from-refresh".into(),
                    refresh_token: Some("new-refresh".into()),
                    expires_in_secs: Some(3600),
                })
            } else {
                Err(CoreError::TokenRefresh("rejected client id".into()))
            }
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        calls: Mutex<Vec<AccountId>>,
    }

    #[async_trait]
    impl CredentialSink for RecordingStore {
        async fn persist(&self, account_id: AccountId, _credential: &OAuthCredential) -> Result<(), CoreError> {
            self.calls.lock().unwrap().push(account_id);
            Ok(())
        }
    }

    fn stale_credential() -> OAuthCredential {
        OAuthCredential {
            refresh_token: "rt".into(),
            access_token: "stale".into(),
            access_token_expires_at: OffsetDateTime::now_utc(),
            project_id: Some("proj".into()),
        }
    }

    fn fresh_credential() -> OAuthCredential {
        OAuthCredential {
            refresh_token: "rt".into(),
            access_token: "still-good".into(),
            access_token_expires_at: OffsetDateTime::now_utc() + Duration::from_secs(3600),
            project_id: Some("proj".into()),
        }
    }

    #[tokio::test]
    async fn returns_cached_token_when_fresh() {
        let provider = TokenProvider::new(
            Arc::new(StubRefresher { accepted_client_id: "client-b" }),
            Arc::new(RecordingStore::default()),
            vec!["client-a".into(), "client-b".into()],
        );
        let mut credential = fresh_credential();
        let token = provider.access_token(1, &mut credential, None).await.unwrap();
        assert_eq!(token, "still-good");
    }

    #[tokio::test]
    async fn tries_candidate_client_ids_in_order_until_one_is_accepted() {
        let provider = TokenProvider::new(
            Arc::new(StubRefresher { accepted_client_id: "client-b" }),
            Arc::new(RecordingStore::default()),
            vec!["client-a".into(), "client-b".into()],
        );
        let mut credential = stale_credential();
        let token = provider.access_token(1, &mut credential, None).await.unwrap();
        assert_eq!(token, "from-refresh");
        assert_eq!(credential.access_token, "from-refresh");
        assert_eq!(credential.refresh_token, "new-refresh");
    }

    #[tokio::test]
    async fn prefers_session_token_exchange_over_refresh_grant() {
        let provider = TokenProvider::new(
            Arc::new(StubRefresher { accepted_client_id: "client-a" }),
            Arc::new(RecordingStore::default()),
            vec!["client-a".into()],
        );
        let mut credential = stale_credential();
        let token = provider
            .access_token(1, &mut credential, Some("session-tok"))
            .await
            .unwrap();
        assert_eq!(token, "from-session");
    }

    #[tokio::test]
    async fn external_source_bypasses_refresh_entirely() {
        struct AlwaysExternal;
        #[async_trait]
        impl ExternalTokenSource for AlwaysExternal {
            async fn token_for(&self, _account_id: AccountId) -> Option<String> {
                Some("external-token".into())
            }
        }

        let provider = TokenProvider::new(
            Arc::new(StubRefresher { accepted_client_id: "client-a" }),
            Arc::new(RecordingStore::default()),
            vec!["client-a".into()],
        )
        .with_external_source(Arc::new(AlwaysExternal));

        let mut credential = stale_credential();
        let token = provider.access_token(1, &mut credential, None).await.unwrap();
        assert_eq!(token, "external-token");
        assert_eq!(credential.access_token, "stale");
    }
}
