//! Push event fan-out to subscriptions.
//!
//! A dedicated router task is the sole consumer of the in-order intake
//! channel fed by the connection's reader. Each subscription has a bounded
//! delivery queue; when one is full the router waits rather than dropping,
//! so a slow subscriber throttles event delivery but never loses events.
//! Response correlation is unaffected either way, since it happens before
//! the intake channel.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;

/// Push event received from the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayEvent {
    /// Event name, e.g. `run.completed`.
    pub name: String,
    /// Event payload.
    pub payload: Value,
}

/// Which events a subscription receives.
#[derive(Debug, Clone, Default)]
pub enum EventFilter {
    /// Every event.
    #[default]
    All,
    /// Exact event name.
    Name(String),
    /// Event names starting with the given prefix, e.g. `run.`.
    Prefix(String),
}

impl EventFilter {
    /// Whether an event with this name passes the filter.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Name(expected) => name == expected,
            Self::Prefix(prefix) => name.starts_with(prefix),
        }
    }
}

struct SubscriptionEntry {
    id: u64,
    filter: EventFilter,
    tx: mpsc::Sender<GatewayEvent>,
}

/// Subscription registry and broadcast logic.
///
/// Entries live here, not in any connection, so they survive reconnects;
/// events from the gap are simply not replayed.
pub(crate) struct Router {
    subs: Mutex<Vec<SubscriptionEntry>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl Router {
    pub(crate) fn new(queue_capacity: usize) -> Self {
        Self {
            subs: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            queue_capacity,
        }
    }

    /// Register a new subscription.
    pub(crate) async fn subscribe(&self, filter: EventFilter) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs.lock().await.push(SubscriptionEntry { id, filter, tx });
        tracing::debug!(id, "subscription opened");
        Subscription { rx }
    }

    /// Deliver one event, in arrival order, to every open subscription whose
    /// filter accepts it. Waits on full queues; prunes closed subscriptions.
    pub(crate) async fn broadcast(&self, event: GatewayEvent) {
        let mut subs = self.subs.lock().await;
        let mut closed = Vec::new();
        for entry in subs.iter() {
            if !entry.filter.matches(&event.name) {
                continue;
            }
            if entry.tx.send(event.clone()).await.is_err() {
                closed.push(entry.id);
            }
        }
        if !closed.is_empty() {
            subs.retain(|entry| !closed.contains(&entry.id));
            tracing::debug!(count = closed.len(), "pruned closed subscriptions");
        }
    }

    /// Drop every subscription sender; receivers observe end-of-stream.
    pub(crate) async fn close_all(&self) {
        self.subs.lock().await.clear();
    }
}

/// Handle to a lazy, in-order, potentially infinite sequence of events.
///
/// Restartable only by creating a new subscription; there is no replay of
/// history. Dropping the handle closes it.
pub struct Subscription {
    rx: mpsc::Receiver<GatewayEvent>,
}

impl Subscription {
    /// Next event, or `None` once the subscription (or client) is closed.
    pub async fn next(&mut self) -> Option<GatewayEvent> {
        self.rx.recv().await
    }

    /// Stop delivery and release the queue. Other subscriptions and the
    /// connection are unaffected.
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Consume the handle as a [`futures::Stream`] of events.
    #[must_use]
    pub fn into_stream(self) -> ReceiverStream<GatewayEvent> {
        ReceiverStream::new(self.rx)
    }
}
