//! Sticky-Session Cache (spec §2 L6): binds a `(group_id, session
//! fingerprint)` pair to the account that served it, for a bounded TTL, so a
//! multi-turn conversation keeps landing on the same account's context
//! cache. Invalidated early if that account picks up a model-level disallow
//! for the model the session is using, see
//! [`antigate_provider_core::AccountPool::has_active_model_disallow`].
//!
//! Grounded on `gproxy-provider-core::pool`'s TTL-keyed map style; this is a
//! new module since gproxy is single-account-per-request and has no
//! sticky-session concept.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use tokio::time::Instant;

use antigate_provider_core::AccountId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StickyKey {
    pub group_id: String,
    pub session_fingerprint: String,
}

struct StickyEntry {
    account_id: AccountId,
    expires_at: Instant,
}

pub struct StickySessionCache {
    ttl: Duration,
    entries: RwLock<HashMap<StickyKey, StickyEntry>>,
}

impl StickySessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, key: &StickyKey) -> Option<AccountId> {
        let now = Instant::now();
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.account_id),
            _ => None,
        }
    }

    pub fn bind(&self, key: StickyKey, account_id: AccountId) {
        self.entries.write().unwrap().insert(
            key,
            StickyEntry {
                account_id,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &StickyKey) {
        self.entries.write().unwrap().remove(key);
    }

    /// Drops every binding currently pointing at `account_id`; called once
    /// the Rate-Limit Classifier marks that account model-disallowed, so a
    /// subsequent lookup for that session falls back to fresh selection.
    pub fn invalidate_account(&self, account_id: AccountId) {
        self.entries
            .write()
            .unwrap()
            .retain(|_, entry| entry.account_id != account_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(session: &str) -> StickyKey {
        StickyKey {
            group_id: "group-1".into(),
            session_fingerprint: session.into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn binds_and_looks_up_within_ttl() {
        let cache = StickySessionCache::new(Duration::from_secs(60));
        cache.bind(key("s1"), 42);
        assert_eq!(cache.lookup(&key("s1")), Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn expires_after_ttl() {
        let cache = StickySessionCache::new(Duration::from_secs(10));
        cache.bind(key("s1"), 42);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.lookup(&key("s1")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_account_clears_every_binding_for_it() {
        let cache = StickySessionCache::new(Duration::from_secs(60));
        cache.bind(key("s1"), 42);
        cache.bind(key("s2"), 42);
        cache.bind(key("s3"), 7);
        cache.invalidate_account(42);
        assert_eq!(cache.lookup(&key("s1")), None);
        assert_eq!(cache.lookup(&key("s2")), None);
        assert_eq!(cache.lookup(&key("s3")), Some(7));
    }
}
