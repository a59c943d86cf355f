//! Client configuration.

use std::time::Duration;

/// Reconnect backoff policy.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First delay.
    pub base: Duration,
    /// Delay ceiling.
    pub cap: Duration,
    /// Give up after this many consecutive failed attempts; `None` retries
    /// forever with the cap in force.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

/// Gateway client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bearer token presented during the handshake.
    pub auth_token: String,
    /// Default deadline for `call()`.
    pub call_timeout: Duration,
    /// Deadline for the whole challenge/response exchange.
    pub handshake_timeout: Duration,
    /// Reconnect policy.
    pub backoff: BackoffConfig,
    /// Bounded per-subscription delivery queue size.
    pub event_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            auth_token: String::new(),
            call_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
            event_queue_capacity: 64,
        }
    }
}

impl ClientConfig {
    /// Config with the given bearer token and defaults elsewhere.
    #[must_use]
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            auth_token: token.into(),
            ..Self::default()
        }
    }
}
