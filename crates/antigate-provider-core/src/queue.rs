//! Min-heap recovery queues backing the account/model disallow auto-clear.
//! Grounded on `gproxy-provider-core::credential::{unavailable_queue,
//! model_unavailable_queue}`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::account::{AccountId, AccountState};
use crate::events::{Event, EventHub, OperationalEvent, UnavailableEndEvent};

#[derive(Debug, Default)]
pub struct UnavailableQueue {
    heap: Mutex<BinaryHeap<Reverse<(Instant, AccountId)>>>,
    notify: Notify,
}

impl UnavailableQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, until: Instant, account_id: AccountId) {
        {
            let mut heap = self.heap.lock().await;
            heap.push(Reverse((until, account_id)));
        }
        self.notify.notify_one();
    }

    pub fn spawn_recover_task(
        self: Arc<Self>,
        states: Arc<RwLock<HashMap<AccountId, AccountState>>>,
        events: EventHub,
    ) {
        tokio::spawn(async move {
            loop {
                let next = {
                    let heap = self.heap.lock().await;
                    heap.peek().map(|Reverse((t, id))| (*t, *id))
                };

                match next {
                    None => {
                        self.notify.notified().await;
                        continue;
                    }
                    Some((deadline, _)) => sleep_until(deadline).await,
                }

                let now = Instant::now();
                let mut due: Vec<(Instant, AccountId)> = Vec::new();
                {
                    let mut heap = self.heap.lock().await;
                    while let Some(Reverse((t, id))) = heap.peek().copied()
                        && t <= now
                    {
                        heap.pop();
                        due.push((t, id));
                    }
                }

                if due.is_empty() {
                    continue;
                }

                let mut guard = states.write().await;
                for (_t, id) in due {
                    let should_recover = match guard.get(&id) {
                        Some(AccountState::Unavailable { until, .. }) => *until <= now,
                        _ => false,
                    };
                    if should_recover {
                        guard.insert(id, AccountState::Active);
                        debug!(account_id = id, "account disallow window cleared");
                        events
                            .emit(Event::Operational(OperationalEvent::UnavailableEnd(
                                UnavailableEndEvent {
                                    account_id: id,
                                    at: SystemTime::now(),
                                },
                            )))
                            .await;
                    }
                }
            }
        });
    }
}

type ModelStateKey = (AccountId, String);
type ModelStateValue = (Instant, crate::account::UnavailableReason);

#[derive(Debug, Default)]
pub struct ModelUnavailableQueue {
    heap: Mutex<BinaryHeap<Reverse<(Instant, AccountId, String)>>>,
    notify: Notify,
}

impl ModelUnavailableQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, until: Instant, account_id: AccountId, model: String) {
        {
            let mut heap = self.heap.lock().await;
            heap.push(Reverse((until, account_id, model)));
        }
        self.notify.notify_one();
    }

    pub fn spawn_recover_task(
        self: Arc<Self>,
        model_states: Arc<RwLock<HashMap<ModelStateKey, ModelStateValue>>>,
        events: EventHub,
    ) {
        tokio::spawn(async move {
            loop {
                let next = {
                    let heap = self.heap.lock().await;
                    heap.peek().map(|Reverse((t, id, model))| (*t, *id, model.clone()))
                };

                match next {
                    None => {
                        self.notify.notified().await;
                        continue;
                    }
                    Some((deadline, ..)) => sleep_until(deadline).await,
                }

                let now = Instant::now();
                let mut due: Vec<(Instant, AccountId, String)> = Vec::new();
                {
                    let mut heap = self.heap.lock().await;
                    while let Some(Reverse((t, id, model))) = heap.peek().cloned()
                        && t <= now
                    {
                        heap.pop();
                        due.push((t, id, model));
                    }
                }

                if due.is_empty() {
                    continue;
                }

                let mut guard = model_states.write().await;
                for (_t, id, model) in due {
                    let key = (id, model.clone());
                    let should_recover = match guard.get(&key) {
                        Some((until, _)) => *until <= now,
                        None => false,
                    };
                    if should_recover {
                        guard.remove(&key);
                        debug!(account_id = id, model = %model, "model disallow window cleared");
                        events
                            .emit(Event::Operational(OperationalEvent::ModelUnavailableEnd(
                                crate::events::ModelUnavailableEndEvent {
                                    account_id: id,
                                    model,
                                    at: SystemTime::now(),
                                },
                            )))
                            .await;
                    }
                }
            }
        });
    }
}
