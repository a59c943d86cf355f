//! Public client facade: `call`, `subscribe`, and lifecycle.

use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use gateway_transport::Connector;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::{
    config::ClientConfig,
    error::ClientError,
    handshake::SessionInfo,
    idempotency::{self, RunLedger},
    identity::DeviceIdentity,
    router::{EventFilter, GatewayEvent, Subscription},
    supervisor::{self, ConnectionState, Shared},
};

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Deadline override; the config default applies when `None`.
    pub timeout: Option<Duration>,
    /// Declare the call mutating: an idempotency key is attached (generated
    /// when not supplied) and the resulting run is tracked for duplicate
    /// terminal suppression.
    pub mutating: bool,
    /// Explicit idempotency key for a mutating call.
    pub idempotency_key: Option<String>,
}

impl CallOptions {
    /// Options for a mutating call with a generated idempotency key.
    #[must_use]
    pub fn mutating() -> Self {
        Self {
            mutating: true,
            ..Self::default()
        }
    }

    /// Options for a mutating call with an explicit idempotency key.
    #[must_use]
    pub fn mutating_with_key(key: impl Into<String>) -> Self {
        Self {
            mutating: true,
            idempotency_key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Set the per-call deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Connection health snapshot.
#[derive(Debug, Clone)]
pub struct Health {
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Negotiated session, present once a handshake has succeeded.
    pub session: Option<SessionInfo>,
}

/// Client for one long-lived, authenticated gateway connection.
///
/// Construct with [`GatewayClient::new`], then [`connect`](Self::connect).
/// All methods take `&self`; the client is cheap to share behind an `Arc`.
/// Multiple clients are fully independent.
pub struct GatewayClient {
    shared: Arc<Shared>,
    config: ClientConfig,
    startup: StdMutex<Option<Startup>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Everything the supervisor takes ownership of on first `connect()`.
struct Startup {
    connector: Box<dyn Connector>,
    identity: DeviceIdentity,
    intake: mpsc::UnboundedReceiver<GatewayEvent>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayClient {
    /// Create a client. No I/O happens until [`connect`](Self::connect).
    #[must_use]
    pub fn new(
        connector: Box<dyn Connector>,
        identity: DeviceIdentity,
        config: ClientConfig,
    ) -> Self {
        let (shared, intake) = Shared::new(config.event_queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shared,
            config,
            startup: StdMutex::new(Some(Startup {
                connector,
                identity,
                intake,
                shutdown_rx,
            })),
            shutdown_tx,
        }
    }

    /// Establish the connection and complete the handshake.
    ///
    /// Retryable failures are handled internally with backoff; this returns
    /// once the connection is Ready, or with an error once it is Closed
    /// (credential rejection or retry exhaustion).
    ///
    /// # Errors
    /// Returns [`ClientError::Auth`] on rejection, [`ClientError::Connection`]
    /// when retries are exhausted or the client was already closed.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.start_supervisor();

        let mut state_rx = self.shared.watch_state();
        loop {
            match *state_rx.borrow_and_update() {
                ConnectionState::Ready => return Ok(()),
                ConnectionState::Closed => {
                    return Err(self
                        .shared
                        .take_error()
                        .unwrap_or_else(|| ClientError::Connection("client closed".to_string())));
                }
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(ClientError::Connection("supervisor stopped".to_string()));
            }
        }
    }

    fn start_supervisor(&self) {
        let startup = self.startup.lock().expect("startup lock poisoned").take();
        if let Some(startup) = startup {
            tokio::spawn(supervisor::route_events(
                Arc::clone(&self.shared),
                startup.intake,
            ));
            tokio::spawn(supervisor::run(
                Arc::clone(&self.shared),
                startup.connector,
                startup.identity,
                self.config.clone(),
                startup.shutdown_rx,
            ));
        }
    }

    /// Close the connection. Terminal and idempotent: pending calls fail
    /// with a connection-closed error, subscriptions end, and no reconnect
    /// follows.
    pub async fn close(&self) {
        let never_started = self.startup.lock().expect("startup lock poisoned").take();
        let _ = self.shutdown_tx.send(true);

        if never_started.is_some() {
            self.shared.shut_down("client closed").await;
            return;
        }

        let mut state_rx = self.shared.watch_state();
        loop {
            if *state_rx.borrow_and_update() == ConnectionState::Closed {
                return;
            }
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Current health snapshot.
    #[must_use]
    pub fn health(&self) -> Health {
        Health {
            state: self.shared.state(),
            session: self.shared.session(),
        }
    }

    /// Issue a correlated RPC with default options.
    ///
    /// # Errors
    /// One of [`ClientError::Connection`], [`ClientError::Timeout`], or
    /// [`ClientError::Gateway`]; never more than one outcome per call.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        self.call_with(method, params, CallOptions::default()).await
    }

    /// Issue a correlated RPC.
    ///
    /// Abandoning the returned future removes local bookkeeping only; the
    /// gateway may still execute the operation. Use an idempotency key
    /// (`options.mutating`) when that matters.
    ///
    /// # Errors
    /// See [`call`](Self::call).
    pub async fn call_with(
        &self,
        method: &str,
        mut params: Value,
        options: CallOptions,
    ) -> Result<Value, ClientError> {
        let state = self.shared.state();
        if state != ConnectionState::Ready {
            return Err(ClientError::Connection(format!(
                "connection not ready ({state:?})"
            )));
        }

        let key = if options.mutating {
            Some(attach_idempotency_key(
                &mut params,
                options.idempotency_key.clone(),
            ))
        } else {
            None
        };

        let id = self.shared.correlator.next_id();
        let frame = gateway_protocol::OutboundFrame::request(id.clone(), method, params)
            .to_wire()
            .map_err(|e| ClientError::Protocol(e.to_string()))?;

        let rx = self.shared.correlator.register(&id);

        let writer = self.shared.writer().ok_or_else(|| {
            self.shared.correlator.cancel(&id);
            ClientError::Connection("connection not ready".to_string())
        })?;
        if writer.send(frame).await.is_err() {
            self.shared.correlator.cancel(&id);
            return Err(ClientError::Connection("connection lost".to_string()));
        }

        let deadline = options.timeout.unwrap_or(self.config.call_timeout);
        let outcome = match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ClientError::Connection("connection closed".to_string())),
            Err(_) => {
                self.shared.correlator.cancel(&id);
                Err(ClientError::Timeout {
                    method: method.to_string(),
                    after: deadline,
                })
            }
        };

        if let (Some(key), Ok(payload)) = (key, &outcome) {
            if let Some(run_id) = idempotency::run_id_of(payload) {
                self.shared.ledger.record_run(&key, run_id);
            }
        }
        outcome
    }

    /// Open a push event subscription.
    ///
    /// Delivery preserves arrival order. The subscription survives
    /// reconnects (events from the gap are not replayed) and ends only when
    /// closed or when the client closes.
    pub async fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.shared.router.subscribe(filter).await
    }
}

/// Ensure object params carry an idempotency key, generating one when the
/// caller omitted it. Returns the key in force.
fn attach_idempotency_key(params: &mut Value, explicit: Option<String>) -> String {
    match params {
        Value::Object(map) => {
            if let Some(Value::String(existing)) = map.get("idempotencyKey") {
                return existing.clone();
            }
            let key = RunLedger::ensure_key(explicit);
            map.insert("idempotencyKey".to_string(), Value::String(key.clone()));
            key
        }
        Value::Null => {
            let key = RunLedger::ensure_key(explicit);
            *params = serde_json::json!({ "idempotencyKey": key });
            key
        }
        // Non-object params are passed through untouched.
        _ => RunLedger::ensure_key(explicit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attach_key_generates_when_missing() {
        let mut params = json!({"prompt": "hi"});
        let key = attach_idempotency_key(&mut params, None);
        assert_eq!(params["idempotencyKey"], json!(key));
    }

    #[test]
    fn test_attach_key_keeps_existing_field() {
        let mut params = json!({"idempotencyKey": "caller-key"});
        attach_idempotency_key(&mut params, None);
        assert_eq!(params["idempotencyKey"], "caller-key");
    }

    #[test]
    fn test_attach_key_explicit() {
        let mut params = Value::Null;
        let key = attach_idempotency_key(&mut params, Some("k-1".to_string()));
        assert_eq!(key, "k-1");
        assert_eq!(params, json!({"idempotencyKey": "k-1"}));
    }
}
