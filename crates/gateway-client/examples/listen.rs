//! Connect to a gateway over WebSocket and print push events.
//!
//! Run with: cargo run -p gateway-client --example listen -- ws://localhost:4000/ws
//!
//! Reads the bearer token from the GATEWAY_TOKEN environment variable.

use gateway_client::{ClientConfig, DeviceIdentity, EventFilter, GatewayClient};
use gateway_transport::websocket::WsConnector;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:4000/ws".to_string());
    let token = std::env::var("GATEWAY_TOKEN").unwrap_or_default();

    let identity = DeviceIdentity::generate("listen-example", "observer", vec![]);
    let client = GatewayClient::new(
        Box::new(WsConnector::new(url)),
        identity,
        ClientConfig::with_token(token),
    );

    client.connect().await?;
    tracing::info!(health = ?client.health(), "connected");

    let mut events = client.subscribe(EventFilter::All).await;
    while let Some(event) = events.next().await {
        println!("{}: {}", event.name, event.payload);
    }

    client.close().await;
    Ok(())
}
