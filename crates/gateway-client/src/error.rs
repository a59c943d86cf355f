//! Client error taxonomy.

use std::time::Duration;

use gateway_protocol::ErrorBody;

/// Error surfaced to callers of the client.
///
/// A single `call()` observes exactly one of `Connection`, `Timeout`,
/// `Gateway`, or success. `Auth` surfaces only through `connect()` and is
/// fatal; `Protocol` covers malformed traffic, which is recovered locally
/// except during the pre-auth challenge step.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport unavailable or lost. Retryable; the client reconnects on
    /// its own.
    #[error("connection unavailable: {0}")]
    Connection(String),
    /// Handshake rejected by the gateway. Fatal; not retried with the same
    /// credentials.
    #[error("authentication rejected: {0}")]
    Auth(String),
    /// No response before the deadline. The gateway may still have executed
    /// the operation; callers needing exactly-once effects use idempotency
    /// keys.
    #[error("no response to {method} within {after:?}; remote effect unknown")]
    Timeout { method: String, after: Duration },
    /// Structured error returned by the gateway.
    #[error(transparent)]
    Gateway(#[from] ErrorBody),
    /// Malformed or unexpected frame.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Whether retrying the operation can reasonably succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability() {
        assert!(ClientError::Connection("lost".into()).is_retryable());
        assert!(
            ClientError::Timeout {
                method: "runs.start".into(),
                after: Duration::from_secs(30),
            }
            .is_retryable()
        );
        assert!(!ClientError::Auth("bad token".into()).is_retryable());
    }

    #[test]
    fn test_timeout_message_flags_unknown_remote_effect() {
        let err = ClientError::Timeout {
            method: "runs.start".into(),
            after: Duration::from_millis(50),
        };
        assert!(err.to_string().contains("remote effect unknown"));
    }
}
