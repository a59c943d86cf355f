//! Transport layer for the gateway connection.
//!
//! Provides:
//! - `Transport`/`Connector` - opaque duplex frame channel abstractions
//! - WebSocket implementation (feature: websocket)
//! - In-memory implementation for deterministic tests

pub mod memory;

#[cfg(feature = "websocket")]
pub mod websocket;

use async_trait::async_trait;

/// Transport error.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection lost: {0}")]
    Lost(String),
    #[error("transport closed")]
    Closed,
}

/// Opaque duplex channel carrying one text frame per message.
///
/// Implementations do not interpret frame contents; framing and parsing
/// belong to the caller.
#[async_trait]
pub trait Transport: Send {
    /// Send one frame.
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Receive the next frame. `Ok(None)` means the peer closed cleanly.
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;

    /// Close the channel. Idempotent.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Factory dialing a fresh [`Transport`], once per (re)connect attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a new transport to the gateway.
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError>;
}
