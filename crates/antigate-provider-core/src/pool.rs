//! Account State Store (spec §4.L5): tracks per-account and per-account/model
//! disallow windows and serves weighted, unavailability-aware selection to
//! the retry loop (§4.C1).
//!
//! Grounded on `gproxy-provider-core::credential::pool::CredentialPool`; we
//! follow the plural/newer generation's model-keyed shape (see
//! `SPEC_FULL.md` §9) rather than the older provider-wide `credential_pool.rs`
//! scheme.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::Rng;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::warn;

use crate::account::{Account, AccountId, AccountState, UnavailableReason};
use crate::events::{Event, EventHub, ModelUnavailableStartEvent, OperationalEvent, UnavailableStartEvent};
use crate::queue::{ModelUnavailableQueue, UnavailableQueue};

type ModelStateKey = (AccountId, String);
type ModelStateValue = (Instant, UnavailableReason);

#[derive(Debug, Clone, thiserror::Error)]
pub enum AcquireError {
    #[error("no accounts are registered")]
    NoAccounts,
    #[error("every registered account is currently unavailable")]
    NoActiveAccounts,
}

pub struct AccountPool {
    accounts: RwLock<HashMap<AccountId, Account>>,
    order: RwLock<Vec<AccountId>>,
    states: Arc<RwLock<HashMap<AccountId, AccountState>>>,
    model_states: Arc<RwLock<HashMap<ModelStateKey, ModelStateValue>>>,
    events: EventHub,
    queue: Arc<UnavailableQueue>,
    model_queue: Arc<ModelUnavailableQueue>,
}

impl AccountPool {
    pub fn new(events: EventHub) -> Self {
        let states = Arc::new(RwLock::new(HashMap::new()));
        let model_states = Arc::new(RwLock::new(HashMap::new()));
        let queue = Arc::new(UnavailableQueue::new());
        let model_queue = Arc::new(ModelUnavailableQueue::new());
        queue.clone().spawn_recover_task(states.clone(), events.clone());
        model_queue
            .clone()
            .spawn_recover_task(model_states.clone(), events.clone());
        Self {
            accounts: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            states,
            model_states,
            events,
            queue,
            model_queue,
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub async fn insert(&self, account: Account) {
        let id = account.id;
        self.accounts.write().await.insert(id, account);
        let mut order = self.order.write().await;
        if !order.contains(&id) {
            order.push(id);
        }
        self.states.write().await.entry(id).or_insert(AccountState::Active);
    }

    pub async fn remove(&self, id: AccountId) {
        self.accounts.write().await.remove(&id);
        self.order.write().await.retain(|x| *x != id);
        self.states.write().await.remove(&id);
        self.model_states.write().await.retain(|(acc, _), _| *acc != id);
    }

    /// Weighted-random pick among active, unrestricted accounts. Returning a
    /// fresh weighted choice per call (rather than round-robin) keeps the
    /// distribution fair even as accounts flap in and out of availability.
    pub async fn acquire(&self) -> Result<Account, AcquireError> {
        self.acquire_candidates(None).await
    }

    pub async fn acquire_for_model(&self, model: &str) -> Result<Account, AcquireError> {
        self.acquire_candidates(Some(model)).await
    }

    async fn acquire_candidates(&self, model: Option<&str>) -> Result<Account, AcquireError> {
        let order = self.order.read().await;
        if order.is_empty() {
            return Err(AcquireError::NoAccounts);
        }

        let now = Instant::now();
        let states = self.states.read().await;
        let model_states = self.model_states.read().await;
        let accounts = self.accounts.read().await;

        let candidates: Vec<&Account> = order
            .iter()
            .filter(|id| matches!(states.get(id), Some(AccountState::Active)))
            .filter(|id| match model {
                None => true,
                Some(model) => {
                    let key = ((**id), model.to_string());
                    match model_states.get(&key) {
                        Some((until, _)) => *until <= now,
                        None => true,
                    }
                }
            })
            .filter_map(|id| accounts.get(id))
            .collect();

        if candidates.is_empty() {
            return Err(AcquireError::NoActiveAccounts);
        }

        let total_weight: u64 = candidates.iter().map(|a| a.weight.max(1) as u64).sum();
        let mut pick = rand::rng().random_range(0..total_weight);
        for account in &candidates {
            let weight = account.weight.max(1) as u64;
            if pick < weight {
                return Ok((*account).clone());
            }
            pick -= weight;
        }
        Ok(candidates[0].clone())
    }

    pub async fn mark_unavailable(&self, account_id: AccountId, duration: Duration, reason: UnavailableReason) {
        let until_instant = Instant::now() + duration;
        {
            let mut guard = self.states.write().await;
            guard.insert(
                account_id,
                AccountState::Unavailable {
                    until: until_instant,
                    reason,
                },
            );
        }
        self.queue.push(until_instant, account_id).await;

        let until_wall = SystemTime::now().checked_add(duration).unwrap_or_else(SystemTime::now);
        warn!(account_id, ?reason, delay_ms = duration.as_millis() as u64, "account disallowed");
        self.events
            .emit(Event::Operational(OperationalEvent::UnavailableStart(
                UnavailableStartEvent {
                    at: SystemTime::now(),
                    account_id,
                    reason,
                    until: until_wall,
                },
            )))
            .await;
    }

    pub async fn mark_model_unavailable(
        &self,
        account_id: AccountId,
        model: impl Into<String>,
        duration: Duration,
        reason: UnavailableReason,
    ) {
        let model = model.into();
        let until_instant = Instant::now() + duration;
        {
            let mut guard = self.model_states.write().await;
            guard.insert((account_id, model.clone()), (until_instant, reason));
        }
        self.model_queue.push(until_instant, account_id, model.clone()).await;

        let until_wall = SystemTime::now().checked_add(duration).unwrap_or_else(SystemTime::now);
        warn!(account_id, model = %model, ?reason, delay_ms = duration.as_millis() as u64, "account/model disallowed");
        self.events
            .emit(Event::Operational(OperationalEvent::ModelUnavailableStart(
                ModelUnavailableStartEvent {
                    at: SystemTime::now(),
                    account_id,
                    model,
                    reason,
                    until: until_wall,
                },
            )))
            .await;
    }

    pub async fn state(&self, account_id: AccountId) -> Option<AccountState> {
        self.states.read().await.get(&account_id).cloned()
    }

    pub async fn model_states(&self, account_id: AccountId) -> Vec<(String, Instant, UnavailableReason)> {
        let now = Instant::now();
        let guard = self.model_states.read().await;
        let mut rows = Vec::new();
        for ((id, model), (until, reason)) in guard.iter() {
            if *id != account_id || *until <= now {
                continue;
            }
            rows.push((model.clone(), *until, *reason));
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// Sticky-session invalidation (spec §4.L6): any model-level disallow on
    /// this account clears the caller's sticky binding to it.
    pub async fn has_active_model_disallow(&self, account_id: AccountId, model: &str) -> bool {
        let now = Instant::now();
        let guard = self.model_states.read().await;
        matches!(guard.get(&(account_id, model.to_string())), Some((until, _)) if *until > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::OAuthCredential;

    fn test_account(id: AccountId, weight: u32) -> Account {
        Account {
            id,
            label: format!("acct-{id}"),
            credential: OAuthCredential {
                refresh_token: "rt".into(),
                access_token: "at".into(),
                access_token_expires_at: time::OffsetDateTime::now_utc(),
                project_id: Some("proj".into()),
            },
            weight,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_recovers_via_queue() {
        let hub = EventHub::new(16);
        let mut rx = hub.subscribe();
        let pool = AccountPool::new(hub);
        pool.insert(test_account(1, 1)).await;

        pool.mark_unavailable(1, Duration::from_millis(50), UnavailableReason::RateLimit)
            .await;

        let ev = rx.recv().await.unwrap();
        assert!(matches!(ev, Event::Operational(OperationalEvent::UnavailableStart(_))));

        tokio::time::advance(Duration::from_millis(60)).await;
        let ev = rx.recv().await.unwrap();
        assert!(matches!(ev, Event::Operational(OperationalEvent::UnavailableEnd(_))));

        let state = pool.state(1).await.unwrap();
        assert!(state.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn model_disallow_excludes_account_for_that_model_only() {
        let hub = EventHub::new(16);
        let pool = AccountPool::new(hub);
        pool.insert(test_account(1, 1)).await;

        pool.mark_model_unavailable(1, "gemini-pro", Duration::from_secs(5), UnavailableReason::RateLimit)
            .await;

        assert!(pool.acquire_for_model("gemini-pro").await.is_err());
        assert!(pool.acquire_for_model("gemini-flash").await.is_ok());
        assert!(pool.has_active_model_disallow(1, "gemini-pro").await);
    }

    #[tokio::test]
    async fn acquire_fails_with_no_accounts() {
        let pool = AccountPool::new(EventHub::new(4));
        assert!(matches!(pool.acquire().await, Err(AcquireError::NoAccounts)));
    }

    #[tokio::test]
    async fn weighted_acquire_only_returns_active_accounts() {
        let pool = AccountPool::new(EventHub::new(4));
        pool.insert(test_account(1, 10)).await;
        pool.insert(test_account(2, 1)).await;
        pool.mark_unavailable(1, Duration::from_secs(30), UnavailableReason::Upstream5xx)
            .await;

        for _ in 0..20 {
            let picked = pool.acquire().await.unwrap();
            assert_eq!(picked.id, 2);
        }
    }
}
