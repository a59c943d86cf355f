//! WebSocket transport for the network gateway.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message,
};

use crate::{Connector, Transport, TransportError};

/// Connector dialing a `ws://` or `wss://` gateway URL.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// Create a connector for the given gateway URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        let (stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::debug!(url = %self.url, status = %response.status(), "websocket established");
        Ok(Box::new(WsTransport { inner: stream }))
    }
}

/// One established WebSocket connection.
pub struct WsTransport {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.inner
            .send(Message::Text(frame))
            .await
            .map_err(|e| TransportError::Lost(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.inner.next().await {
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => {
                        tracing::warn!("dropping non-UTF-8 binary frame");
                    }
                },
                // Pings are answered by tungstenite on the next send/read.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TransportError::Lost(e.to_string())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        use tokio_tungstenite::tungstenite::Error;
        match self.inner.close(None).await {
            Ok(()) | Err(Error::ConnectionClosed | Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::Lost(e.to_string())),
        }
    }
}
