//! Operational event hub. This is the interface boundary into the (out of
//! scope) alert rule engine and system-log sink: we emit structured events
//! here, we do not implement what consumes them.
//!
//! Grounded on `gproxy-provider-core::events::{hub,types}`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{RwLock, broadcast};

use crate::account::{AccountId, UnavailableReason};

#[derive(Debug, Clone)]
pub struct UnavailableStartEvent {
    pub at: SystemTime,
    pub account_id: AccountId,
    pub reason: UnavailableReason,
    pub until: SystemTime,
}

#[derive(Debug, Clone)]
pub struct UnavailableEndEvent {
    pub account_id: AccountId,
    pub at: SystemTime,
}

#[derive(Debug, Clone)]
pub struct ModelUnavailableStartEvent {
    pub at: SystemTime,
    pub account_id: AccountId,
    pub model: String,
    pub reason: UnavailableReason,
    pub until: SystemTime,
}

#[derive(Debug, Clone)]
pub struct ModelUnavailableEndEvent {
    pub account_id: AccountId,
    pub model: String,
    pub at: SystemTime,
}

#[derive(Debug, Clone)]
pub enum OperationalEvent {
    UnavailableStart(UnavailableStartEvent),
    UnavailableEnd(UnavailableEndEvent),
    ModelUnavailableStart(ModelUnavailableStartEvent),
    ModelUnavailableEnd(ModelUnavailableEndEvent),
}

#[derive(Debug, Clone)]
pub enum Event {
    Operational(OperationalEvent),
}

pub trait EventSink: Send + Sync {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

pub struct NoopSink;

impl EventSink for NoopSink {
    fn write<'a>(&'a self, _event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async {})
    }
}

#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Inner>,
}

struct Inner {
    tx: broadcast::Sender<Event>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            inner: Arc::new(Inner {
                tx,
                sinks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.tx.subscribe()
    }

    pub async fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.inner.sinks.write().await.push(sink);
    }

    pub async fn emit(&self, event: Event) {
        let _ = self.inner.tx.send(event.clone());
        let sinks = self.inner.sinks.read().await.clone();
        for sink in sinks {
            let event_ref = event.clone();
            tokio::spawn(async move {
                sink.write(&event_ref).await;
            });
        }
    }
}
