//! Connection lifecycle: state machine, single reader, reconnect loop.

use std::sync::{Arc, Mutex as StdMutex};

use gateway_protocol::InboundFrame;
use gateway_transport::{Connector, Transport};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::{
    backoff::Backoff,
    config::ClientConfig,
    correlator::Correlator,
    error::ClientError,
    handshake::{self, HandshakeError, SessionInfo},
    idempotency::{self, RunLedger},
    identity::DeviceIdentity,
    router::{GatewayEvent, Router},
};

/// Connection lifecycle state. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Created, never connected.
    Disconnected,
    /// Dialing the transport.
    Connecting,
    /// Transport up, handshake in progress.
    Authenticating,
    /// Authenticated; calls and events flow.
    Ready,
    /// Transport lost; waiting out the backoff before redialing.
    Reconnecting,
    /// Terminal. Entered on `close()`, credential rejection, or retry
    /// exhaustion; never left.
    Closed,
}

/// State shared between the supervisor task, the router task, and the
/// client facade.
pub(crate) struct Shared {
    state_tx: watch::Sender<ConnectionState>,
    pub(crate) correlator: Correlator,
    pub(crate) router: Router,
    pub(crate) ledger: RunLedger,
    outbound: StdMutex<Option<mpsc::Sender<String>>>,
    session: StdMutex<Option<SessionInfo>>,
    last_error: StdMutex<Option<ClientError>>,
    events_tx: StdMutex<Option<mpsc::UnboundedSender<GatewayEvent>>>,
}

impl Shared {
    /// Build the shared state plus the intake the router task drains.
    pub(crate) fn new(
        event_queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Self {
            state_tx,
            correlator: Correlator::new(),
            router: Router::new(event_queue_capacity),
            ledger: RunLedger::new(),
            outbound: StdMutex::new(None),
            session: StdMutex::new(None),
            last_error: StdMutex::new(None),
            events_tx: StdMutex::new(Some(events_tx)),
        });
        (shared, events_rx)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(?previous, ?state, "connection state change");
        }
    }

    pub(crate) fn session(&self) -> Option<SessionInfo> {
        self.session.lock().expect("session lock poisoned").clone()
    }

    pub(crate) fn writer(&self) -> Option<mpsc::Sender<String>> {
        self.outbound.lock().expect("writer lock poisoned").clone()
    }

    fn install_writer(&self, tx: mpsc::Sender<String>) {
        *self.outbound.lock().expect("writer lock poisoned") = Some(tx);
    }

    fn clear_writer(&self) {
        *self.outbound.lock().expect("writer lock poisoned") = None;
    }

    pub(crate) fn record_error(&self, err: ClientError) {
        *self.last_error.lock().expect("error lock poisoned") = Some(err);
    }

    pub(crate) fn take_error(&self) -> Option<ClientError> {
        self.last_error.lock().expect("error lock poisoned").take()
    }

    /// Route one inbound frame. Runs on the reader; never performs
    /// caller-supplied work inline.
    fn dispatch(&self, frame: &str) {
        match InboundFrame::parse(frame) {
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed frame");
            }
            Ok(InboundFrame::Challenge { .. }) => {
                tracing::warn!("dropping challenge frame received after authentication");
            }
            Ok(InboundFrame::Response { id, result }) => {
                self.correlator.resolve(&id, result);
            }
            Ok(InboundFrame::Event { name, payload }) => {
                if let Some(run_id) = idempotency::run_id_of(&payload) {
                    if idempotency::is_terminal_event(&name)
                        && !self.ledger.observe_terminal(run_id)
                    {
                        tracing::debug!(run_id, event = %name, "dropping duplicate terminal notification");
                        return;
                    }
                }
                let intake = self.events_tx.lock().expect("events lock poisoned");
                if let Some(tx) = intake.as_ref() {
                    let _ = tx.send(GatewayEvent { name, payload });
                }
            }
        }
    }

    /// Terminal teardown: fail in-flight work, end event delivery.
    pub(crate) async fn shut_down(&self, reason: &str) {
        self.clear_writer();
        self.correlator.fail_all(reason);
        self.events_tx.lock().expect("events lock poisoned").take();
        self.router.close_all().await;
        self.set_state(ConnectionState::Closed);
    }
}

/// Fan events out from the reader's intake to subscriptions, preserving
/// arrival order. Ends when the intake side is dropped at shutdown.
pub(crate) async fn route_events(
    shared: Arc<Shared>,
    mut intake: mpsc::UnboundedReceiver<GatewayEvent>,
) {
    while let Some(event) = intake.recv().await {
        shared.router.broadcast(event).await;
    }
}

enum LoopExit {
    Shutdown,
    Lost(String),
}

/// Long-lived supervisor: drives connect/handshake/read/reconnect until
/// shutdown, a credential rejection, or retry exhaustion.
pub(crate) async fn run(
    shared: Arc<Shared>,
    connector: Box<dyn Connector>,
    identity: DeviceIdentity,
    config: ClientConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(&config.backoff);
    let mut attempts: u32 = 0;
    let mut close_reason = "connection closed";

    loop {
        if *shutdown.borrow() {
            break;
        }
        shared.set_state(ConnectionState::Connecting);

        let dialed = tokio::select! {
            result = connector.connect() => result,
            _ = shutdown.changed() => break,
        };
        let mut transport = match dialed {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!(error = %e, "connect attempt failed");
                if retry_delay(&shared, &config, &mut backoff, &mut attempts, &mut shutdown, &e.to_string()).await {
                    continue;
                }
                close_reason = "reconnect attempts exhausted";
                break;
            }
        };

        shared.set_state(ConnectionState::Authenticating);
        let handshake_id = shared.correlator.next_id();
        // The select only picks the step; transport I/O happens after it,
        // once the handshake future's borrow has ended.
        let handshake = tokio::select! {
            result = handshake::authenticate(
                transport.as_mut(),
                &identity,
                &config.auth_token,
                handshake_id,
                config.handshake_timeout,
            ) => Some(result),
            _ = shutdown.changed() => None,
        };
        let Some(handshake) = handshake else {
            let _ = transport.close().await;
            break;
        };
        let session = match handshake {
            Ok(session) => session,
            Err(HandshakeError::Rejected(reason)) => {
                tracing::error!(%reason, "handshake rejected; giving up");
                shared.record_error(ClientError::Auth(reason));
                let _ = transport.close().await;
                close_reason = "authentication rejected";
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "handshake failed");
                let _ = transport.close().await;
                if retry_delay(&shared, &config, &mut backoff, &mut attempts, &mut shutdown, &e.to_string()).await {
                    continue;
                }
                close_reason = "reconnect attempts exhausted";
                break;
            }
        };

        tracing::info!(
            protocol = session.protocol,
            features = ?session.features,
            "gateway connection ready"
        );
        *shared.session.lock().expect("session lock poisoned") = Some(session);
        backoff.reset();
        attempts = 0;

        let (out_tx, out_rx) = mpsc::channel(64);
        shared.install_writer(out_tx);
        shared.set_state(ConnectionState::Ready);

        let exit = read_loop(&shared, transport.as_mut(), out_rx, &mut shutdown).await;
        shared.clear_writer();
        let _ = transport.close().await;

        match exit {
            LoopExit::Shutdown => break,
            LoopExit::Lost(reason) => {
                tracing::warn!(%reason, "transport lost");
                if !retry_delay(&shared, &config, &mut backoff, &mut attempts, &mut shutdown, &reason).await {
                    close_reason = "reconnect attempts exhausted";
                    break;
                }
            }
        }
    }

    shared.shut_down(close_reason).await;
}

/// Enter Reconnecting: fail pending work immediately, then wait out the
/// backoff. Returns `false` when retries are exhausted or shutdown began.
async fn retry_delay(
    shared: &Shared,
    config: &ClientConfig,
    backoff: &mut Backoff,
    attempts: &mut u32,
    shutdown: &mut watch::Receiver<bool>,
    reason: &str,
) -> bool {
    shared.set_state(ConnectionState::Reconnecting);
    shared.correlator.fail_all(reason);

    *attempts += 1;
    if let Some(max) = config.backoff.max_attempts {
        if *attempts >= max {
            tracing::error!(attempts = *attempts, "giving up after repeated connect failures");
            shared.record_error(ClientError::Connection(format!(
                "gave up after {max} failed connect attempts: {reason}"
            )));
            return false;
        }
    }

    let delay = backoff.next_delay();
    tracing::debug!(?delay, attempt = *attempts, "backing off before reconnect");
    tokio::select! {
        () = tokio::time::sleep(delay) => true,
        _ = shutdown.changed() => false,
    }
}

/// The single reader: the only place inbound frames are parsed. Also
/// drains the outbound channel so one task owns the transport.
async fn read_loop(
    shared: &Shared,
    transport: &mut dyn Transport,
    mut out_rx: mpsc::Receiver<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> LoopExit {
    enum Step {
        Stop,
        Outbound(Option<String>),
        Inbound(Result<Option<String>, gateway_transport::TransportError>),
    }

    loop {
        // Pick the next step without touching the transport in a handler:
        // the recv future mutably borrows it until the select expression ends.
        let step = tokio::select! {
            _ = shutdown.changed() => Step::Stop,
            outbound = out_rx.recv() => Step::Outbound(outbound),
            inbound = transport.recv() => Step::Inbound(inbound),
        };
        match step {
            Step::Stop => return LoopExit::Shutdown,
            Step::Outbound(Some(frame)) => {
                if let Err(e) = transport.send(frame).await {
                    return LoopExit::Lost(e.to_string());
                }
            }
            Step::Outbound(None) => {}
            Step::Inbound(Ok(Some(frame))) => shared.dispatch(&frame),
            Step::Inbound(Ok(None)) => return LoopExit::Lost("closed by gateway".to_string()),
            Step::Inbound(Err(e)) => return LoopExit::Lost(e.to_string()),
        }
    }
}
