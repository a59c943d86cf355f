//! Gateway protocol client.
//!
//! Maintains one long-lived, authenticated connection to the gateway and
//! exposes two primitives on top of it:
//! - [`GatewayClient::call`] - correlated request/response RPC
//! - [`GatewayClient::subscribe`] - ordered push event streams
//!
//! plus lifecycle operations `connect`/`close`/`health`. Everything else
//! (typed method wrappers, dashboards, CLIs) is built by callers on top of
//! these primitives.
//!
//! One background supervisor task per client owns the transport, drives the
//! challenge/response handshake, and reconnects with exponential backoff.
//! A reconnect fails every in-flight call with a retryable error; open
//! subscriptions stay registered and resume once the connection is ready
//! again.

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod router;

mod correlator;
mod idempotency;
mod supervisor;

pub use client::{CallOptions, GatewayClient, Health};
pub use config::{BackoffConfig, ClientConfig};
pub use error::ClientError;
pub use handshake::SessionInfo;
pub use identity::DeviceIdentity;
pub use router::{EventFilter, GatewayEvent, Subscription};
pub use supervisor::ConnectionState;
