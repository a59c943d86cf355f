//! Request correlation: pending call bookkeeping.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use gateway_protocol::ErrorBody;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::ClientError;

type ResultSlot = oneshot::Sender<Result<Value, ClientError>>;

/// Tracks in-flight requests and resolves each exactly once.
///
/// Ids are unique for the life of the client, so a late response from a
/// previous connection can never match a request issued after a reconnect.
#[derive(Default)]
pub(crate) struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<String, ResultSlot>>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Mint the next request id.
    pub(crate) fn next_id(&self) -> String {
        format!("r-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a pending request, returning the slot the caller awaits.
    pub(crate) fn register(&self, id: &str) -> oneshot::Receiver<Result<Value, ClientError>> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("correlator lock poisoned")
            .insert(id.to_string(), tx);
        rx
    }

    /// Resolve a pending request from an inbound response frame.
    ///
    /// Returns `false` when the id is unknown (already resolved, cancelled,
    /// or foreign); such responses are ignored.
    pub(crate) fn resolve(&self, id: &str, result: Result<Value, ErrorBody>) -> bool {
        let slot = self
            .pending
            .lock()
            .expect("correlator lock poisoned")
            .remove(id);
        match slot {
            Some(tx) => {
                let _ = tx.send(result.map_err(ClientError::Gateway));
                true
            }
            None => {
                tracing::trace!(id, "ignoring response for unknown request id");
                false
            }
        }
    }

    /// Drop the bookkeeping for an abandoned call (caller-side timeout or
    /// cancel). Has no effect on server-side execution.
    pub(crate) fn cancel(&self, id: &str) {
        self.pending
            .lock()
            .expect("correlator lock poisoned")
            .remove(id);
    }

    /// Fail every pending request, e.g. on reconnect or close.
    pub(crate) fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<ResultSlot> = {
            let mut pending = self.pending.lock().expect("correlator lock poisoned");
            pending.drain().map(|(_, tx)| tx).collect()
        };
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(ClientError::Connection(reason.to_string())));
        }
        if count > 0 {
            tracing::debug!(count, reason, "failed pending requests");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolves_by_id() {
        let correlator = Correlator::new();
        let a = correlator.next_id();
        let b = correlator.next_id();
        assert_ne!(a, b);

        let rx_a = correlator.register(&a);
        let rx_b = correlator.register(&b);

        // Responses arrive in reverse order.
        assert!(correlator.resolve(&b, Ok(json!("for b"))));
        assert!(correlator.resolve(&a, Ok(json!("for a"))));

        assert_eq!(rx_a.await.unwrap().unwrap(), json!("for a"));
        assert_eq!(rx_b.await.unwrap().unwrap(), json!("for b"));
    }

    #[tokio::test]
    async fn test_exactly_once_resolution() {
        let correlator = Correlator::new();
        let id = correlator.next_id();
        let _rx = correlator.register(&id);

        assert!(correlator.resolve(&id, Ok(json!(1))));
        assert!(!correlator.resolve(&id, Ok(json!(2))));
    }

    #[tokio::test]
    async fn test_cancel_after_resolution_is_a_noop() {
        let correlator = Correlator::new();
        let id = correlator.next_id();
        let rx = correlator.register(&id);

        assert!(correlator.resolve(&id, Ok(json!(1))));
        correlator.cancel(&id);
        assert_eq!(rx.await.unwrap().unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_unknown_id_is_ignored() {
        let correlator = Correlator::new();
        assert!(!correlator.resolve("r-999", Ok(json!(null))));
    }

    #[tokio::test]
    async fn test_fail_all_drains_with_connection_error() {
        let correlator = Correlator::new();
        let id = correlator.next_id();
        let rx = correlator.register(&id);

        assert_eq!(correlator.fail_all("reconnecting"), 1);
        assert!(matches!(
            rx.await.unwrap(),
            Err(ClientError::Connection(_))
        ));
        assert_eq!(correlator.fail_all("again"), 0);
    }
}
