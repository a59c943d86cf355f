//! In-memory transport pair for deterministic tests.
//!
//! [`pair`] builds two crossed channels: the client half implements
//! [`Transport`], the other half ([`MemoryEndpoint`]) plays the gateway and
//! lets a test script responses and push events. [`MemoryConnector`] hands
//! out one endpoint per accepted dial so reconnect sequences can be
//! scripted too.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{Connector, Transport, TransportError};

/// Client half of an in-memory connection.
pub struct MemoryTransport {
    tx: mpsc::Sender<String>,
    rx: mpsc::Receiver<String>,
    closed: bool,
}

/// Gateway half of an in-memory connection, driven by tests.
pub struct MemoryEndpoint {
    tx: Option<mpsc::Sender<String>>,
    rx: mpsc::Receiver<String>,
}

/// Build a connected transport/endpoint pair.
#[must_use]
pub fn pair(capacity: usize) -> (MemoryTransport, MemoryEndpoint) {
    let (client_tx, gateway_rx) = mpsc::channel(capacity);
    let (gateway_tx, client_rx) = mpsc::channel(capacity);
    (
        MemoryTransport {
            tx: client_tx,
            rx: client_rx,
            closed: false,
        },
        MemoryEndpoint {
            tx: Some(gateway_tx),
            rx: gateway_rx,
        },
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Lost("endpoint dropped".to_string()))
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        self.rx.close();
        Ok(())
    }
}

impl MemoryEndpoint {
    /// Send a raw frame to the client.
    ///
    /// # Errors
    /// Returns error if the client side is gone or this endpoint was closed.
    pub async fn send(&self, frame: impl Into<String>) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame.into())
            .await
            .map_err(|_| TransportError::Lost("client dropped".to_string()))
    }

    /// Send a JSON value as a frame.
    ///
    /// # Errors
    /// Returns error if the client side is gone.
    pub async fn send_json(&self, value: &Value) -> Result<(), TransportError> {
        self.send(value.to_string()).await
    }

    /// Receive the next raw frame from the client, `None` once it is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Receive the next frame from the client, parsed as JSON.
    pub async fn recv_json(&mut self) -> Option<Value> {
        loop {
            let frame = self.rx.recv().await?;
            match serde_json::from_str(&frame) {
                Ok(value) => return Some(value),
                Err(_) => continue,
            }
        }
    }

    /// Drop the client-facing sender; the client observes a clean EOF.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

/// Connector yielding in-memory transports.
///
/// Each accepted dial produces a fresh pair; the gateway half is delivered
/// on the receiver returned by [`MemoryConnector::new`]. Dials consumed by
/// [`MemoryConnector::fail_next`] are refused instead.
#[derive(Clone)]
pub struct MemoryConnector {
    endpoints: mpsc::UnboundedSender<MemoryEndpoint>,
    fail_remaining: Arc<AtomicUsize>,
    capacity: usize,
}

impl MemoryConnector {
    /// Create a connector and the stream of gateway endpoints it produces.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryEndpoint>) {
        let (endpoints, endpoints_rx) = mpsc::unbounded_channel();
        (
            Self {
                endpoints,
                fail_remaining: Arc::new(AtomicUsize::new(0)),
                capacity: 64,
            },
            endpoints_rx,
        )
    }

    /// Refuse the next `n` dials.
    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.fetch_add(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        let refused = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect("scripted refusal".to_string()));
        }

        let (transport, endpoint) = pair(self.capacity);
        // A dropped receiver just means the test doesn't script this side.
        let _ = self.endpoints.send(endpoint);
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_pair_carries_frames_both_ways() {
        let (mut transport, mut endpoint) = pair(8);

        transport.send("ping".to_string()).await.unwrap();
        assert_eq!(endpoint.recv().await.unwrap(), "ping");

        endpoint.send_json(&json!({"type": "event"})).await.unwrap();
        let frame = transport.recv().await.unwrap().unwrap();
        assert_eq!(frame, r#"{"type":"event"}"#);
    }

    #[tokio::test]
    async fn test_endpoint_close_reads_as_eof() {
        let (mut transport, mut endpoint) = pair(8);
        endpoint.close();
        assert!(transport.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_io() {
        let (mut transport, _endpoint) = pair(8);
        transport.close().await.unwrap();
        assert!(matches!(
            transport.send("x".to_string()).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_connector_scripts_refusals_then_accepts() {
        let (connector, mut endpoints) = MemoryConnector::new();
        connector.fail_next(2);

        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());

        let mut transport = connector.connect().await.unwrap();
        let endpoint = endpoints.recv().await.unwrap();
        endpoint.send("hello").await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap(), "hello");
    }
}
