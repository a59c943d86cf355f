//! Frame types and shape-based classification of inbound traffic.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event name the gateway uses for the pre-auth challenge.
pub const CHALLENGE_EVENT: &str = "connect.challenge";

/// Structured error returned by the gateway for a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ErrorBody {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

/// Message from client to gateway.
///
/// The `type` discriminator is mandatory on the wire; the gateway rejects
/// frames without it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Correlated request.
    Req {
        id: String,
        method: String,
        params: Value,
    },
}

impl OutboundFrame {
    /// Create a request frame.
    #[must_use]
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self::Req {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Serialize to the wire representation.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_wire(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Message from gateway to client, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Reply to a correlated request.
    Response {
        id: String,
        result: Result<Value, ErrorBody>,
    },
    /// Unsolicited push event (no id).
    Event { name: String, payload: Value },
    /// Pre-auth challenge; only valid as the first frame on a fresh
    /// connection.
    Challenge { nonce: String, ts: i64 },
}

/// Frame parse error.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unrecognized frame shape")]
    UnknownShape,
    #[error("malformed {0} frame")]
    Malformed(&'static str),
}

/// Loosely-typed view used to discriminate inbound frames.
///
/// Error responses carry no `type` tag on the wire, so classification is by
/// shape rather than by tag alone.
#[derive(Deserialize)]
struct RawFrame {
    id: Option<String>,
    #[serde(default)]
    ok: bool,
    payload: Option<Value>,
    error: Option<ErrorBody>,
    event: Option<String>,
}

#[derive(Deserialize)]
struct ChallengePayload {
    nonce: String,
    #[serde(default)]
    ts: i64,
}

impl InboundFrame {
    /// Parse a wire frame.
    ///
    /// Classification order: challenge event, then anything carrying a
    /// response id, then anything carrying an event name.
    ///
    /// # Errors
    /// Returns error on invalid JSON, unrecognized shape, or a recognized
    /// shape with malformed fields.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let raw: RawFrame = serde_json::from_str(text)?;

        if raw.event.as_deref() == Some(CHALLENGE_EVENT) {
            let payload = raw.payload.ok_or(FrameError::Malformed("challenge"))?;
            let challenge: ChallengePayload =
                serde_json::from_value(payload).map_err(|_| FrameError::Malformed("challenge"))?;
            return Ok(Self::Challenge {
                nonce: challenge.nonce,
                ts: challenge.ts,
            });
        }

        if let Some(id) = raw.id {
            let result = match raw.error {
                Some(error) => Err(error),
                None if raw.ok => Ok(raw.payload.unwrap_or(Value::Null)),
                None => return Err(FrameError::Malformed("response")),
            };
            return Ok(Self::Response { id, result });
        }

        if let Some(name) = raw.event {
            return Ok(Self::Event {
                name,
                payload: raw.payload.unwrap_or(Value::Null),
            });
        }

        Err(FrameError::UnknownShape)
    }
}
