//! Challenge/response authentication exchange.
//!
//! Runs on the raw transport immediately after it is established, before
//! the connection's reader starts. The first frame on a fresh connection
//! must be the challenge; the client answers with a signed `connect`
//! request and waits for the acknowledgment carrying the negotiated
//! protocol version and feature flags.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use gateway_protocol::{InboundFrame, OutboundFrame};
use gateway_transport::{Transport, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::DeviceIdentity;

/// Lowest protocol version this client speaks.
pub const PROTOCOL_MIN: u32 = 1;
/// Highest protocol version this client speaks.
pub const PROTOCOL_MAX: u32 = 1;

/// Signing string format version, the first pipe-delimited field.
const SIGNATURE_VERSION: &str = "v1";

const CLIENT_NAME: &str = "gateway-client";
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Negotiated session parameters from a successful handshake.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    /// Protocol version the gateway selected.
    #[serde(default = "default_protocol")]
    pub protocol: u32,
    /// Feature flags the gateway advertises.
    #[serde(default)]
    pub features: Vec<String>,
}

const fn default_protocol() -> u32 {
    PROTOCOL_MIN
}

/// Handshake failure.
///
/// Only `Rejected` is fatal to the client; every other variant fails this
/// connection attempt and is retried with backoff.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("gateway rejected credentials: {0}")]
    Rejected(String),
    #[error("protocol error during handshake: {0}")]
    Protocol(String),
    #[error("transport error during handshake: {0}")]
    Transport(#[from] TransportError),
    #[error("no handshake response within {0:?}")]
    Timeout(Duration),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectParams<'a> {
    min_protocol: u32,
    max_protocol: u32,
    client: ClientMeta,
    role: &'a str,
    scopes: &'a [String],
    auth: AuthMeta<'a>,
    device: DeviceMeta<'a>,
}

#[derive(Serialize)]
struct ClientMeta {
    name: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct AuthMeta<'a> {
    token: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceMeta<'a> {
    id: &'a str,
    public_key: String,
    signature: String,
    signed_at: i64,
    nonce: &'a str,
}

/// The fixed, versioned, pipe-delimited string the device key signs.
fn signing_string(
    identity: &DeviceIdentity,
    signed_at: i64,
    token: &str,
    nonce: &str,
) -> String {
    format!(
        "{SIGNATURE_VERSION}|{}|{CLIENT_NAME}|{CLIENT_VERSION}|{}|{}|{signed_at}|{token}|{nonce}",
        identity.device_id(),
        identity.role(),
        identity.scopes().join(","),
    )
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Perform the full challenge/response exchange.
///
/// `request_id` must be unique for the connection; the caller's correlator
/// mints it even though the reader is not running yet.
///
/// # Errors
/// Returns [`HandshakeError::Rejected`] on explicit rejection (fatal) and a
/// retryable variant for timeouts, transport loss, or a malformed exchange.
pub(crate) async fn authenticate(
    transport: &mut dyn Transport,
    identity: &DeviceIdentity,
    token: &str,
    request_id: String,
    timeout: Duration,
) -> Result<SessionInfo, HandshakeError> {
    tokio::time::timeout(
        timeout,
        exchange(transport, identity, token, request_id),
    )
    .await
    .map_err(|_| HandshakeError::Timeout(timeout))?
}

async fn exchange(
    transport: &mut dyn Transport,
    identity: &DeviceIdentity,
    token: &str,
    request_id: String,
) -> Result<SessionInfo, HandshakeError> {
    let first = transport
        .recv()
        .await?
        .ok_or_else(|| HandshakeError::Protocol("connection closed before challenge".into()))?;

    let nonce = match InboundFrame::parse(&first) {
        Ok(InboundFrame::Challenge { nonce, .. }) => nonce,
        Ok(other) => {
            return Err(HandshakeError::Protocol(format!(
                "expected challenge as first frame, got {other:?}"
            )));
        }
        Err(e) => {
            return Err(HandshakeError::Protocol(format!(
                "unparseable first frame: {e}"
            )));
        }
    };

    let signed_at = unix_now();
    let signature = identity.sign_b64(signing_string(identity, signed_at, token, &nonce).as_bytes());

    let params = ConnectParams {
        min_protocol: PROTOCOL_MIN,
        max_protocol: PROTOCOL_MAX,
        client: ClientMeta {
            name: CLIENT_NAME,
            version: CLIENT_VERSION,
        },
        role: identity.role(),
        scopes: identity.scopes(),
        auth: AuthMeta { token },
        device: DeviceMeta {
            id: identity.device_id(),
            public_key: identity.public_key_b64(),
            signature,
            signed_at,
            nonce: &nonce,
        },
    };
    let params = serde_json::to_value(params)
        .map_err(|e| HandshakeError::Protocol(format!("connect params: {e}")))?;

    let frame = OutboundFrame::request(request_id.clone(), "connect", params)
        .to_wire()
        .map_err(|e| HandshakeError::Protocol(e.to_string()))?;
    transport.send(frame).await?;

    let ack = await_ack(transport, &request_id).await?;
    serde_json::from_value(ack)
        .map_err(|e| HandshakeError::Protocol(format!("malformed connect ack: {e}")))
}

/// Wait for the response matching the connect request. Nothing else is
/// permitted on the wire before authentication completes.
async fn await_ack(
    transport: &mut dyn Transport,
    request_id: &str,
) -> Result<Value, HandshakeError> {
    let frame = transport
        .recv()
        .await?
        .ok_or_else(|| HandshakeError::Protocol("connection closed awaiting connect ack".into()))?;

    match InboundFrame::parse(&frame) {
        Ok(InboundFrame::Response { id, result }) if id == request_id => match result {
            Ok(payload) => Ok(payload),
            Err(error) => Err(HandshakeError::Rejected(error.to_string())),
        },
        Ok(other) => Err(HandshakeError::Protocol(format!(
            "expected connect ack, got {other:?}"
        ))),
        Err(e) => Err(HandshakeError::Protocol(format!(
            "unparseable frame awaiting connect ack: {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_transport::memory;
    use serde_json::json;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::generate("dev-1", "agent", vec!["runs".to_string(), "sessions".to_string()])
    }

    #[test]
    fn test_signing_string_layout() {
        let identity = identity();
        let s = signing_string(&identity, 1_700_000_000, "tok", "n1");
        let fields: Vec<&str> = s.split('|').collect();
        assert_eq!(fields.len(), 9);
        assert_eq!(fields[0], "v1");
        assert_eq!(fields[1], "dev-1");
        assert_eq!(fields[4], "agent");
        assert_eq!(fields[5], "runs,sessions");
        assert_eq!(fields[7], "tok");
        assert_eq!(fields[8], "n1");
    }

    #[tokio::test]
    async fn test_successful_exchange() {
        let (mut transport, mut endpoint) = memory::pair(8);

        let gateway = tokio::spawn(async move {
            endpoint
                .send_json(&json!({
                    "type": "event",
                    "event": "connect.challenge",
                    "payload": {"nonce": "n1", "ts": 1},
                }))
                .await
                .unwrap();

            let connect = endpoint.recv_json().await.unwrap();
            assert_eq!(connect["type"], "req");
            assert_eq!(connect["method"], "connect");
            assert_eq!(connect["params"]["device"]["nonce"], "n1");
            assert!(connect["params"]["device"]["signature"].is_string());
            assert_eq!(connect["params"]["auth"]["token"], "tok");

            endpoint
                .send_json(&json!({
                    "type": "res",
                    "id": connect["id"],
                    "ok": true,
                    "payload": {"protocol": 1, "features": ["runs"]},
                }))
                .await
                .unwrap();
            endpoint
        });

        let session = authenticate(
            &mut transport,
            &identity(),
            "tok",
            "r-0".to_string(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(session.protocol, 1);
        assert_eq!(session.features, vec!["runs".to_string()]);
        gateway.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejection_is_fatal_variant() {
        let (mut transport, mut endpoint) = memory::pair(8);

        tokio::spawn(async move {
            endpoint
                .send_json(&json!({
                    "type": "event",
                    "event": "connect.challenge",
                    "payload": {"nonce": "n1"},
                }))
                .await
                .unwrap();
            let connect = endpoint.recv_json().await.unwrap();
            endpoint
                .send_json(&json!({
                    "id": connect["id"],
                    "error": {"code": "auth_invalid", "message": "bad token"},
                }))
                .await
                .unwrap();
            // Keep the endpoint alive until the client has read the reply.
            endpoint.recv().await
        });

        let err = authenticate(
            &mut transport,
            &identity(),
            "tok",
            "r-0".to_string(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HandshakeError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_non_challenge_first_frame_is_protocol_error() {
        let (mut transport, endpoint) = memory::pair(8);
        endpoint
            .send_json(&json!({"type": "event", "event": "run.log", "payload": {}}))
            .await
            .unwrap();

        let err = authenticate(
            &mut transport,
            &identity(),
            "tok",
            "r-0".to_string(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HandshakeError::Protocol(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_gateway_times_out_retryably() {
        let (mut transport, _endpoint) = memory::pair(8);

        let err = authenticate(
            &mut transport,
            &identity(),
            "tok",
            "r-0".to_string(),
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout(_)));
    }
}
