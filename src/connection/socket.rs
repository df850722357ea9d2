//! WebSocket Connector
//!
//! Single responsibility: Open a WebSocket to a URL.
//! No knowledge of RPC framing, retries or authentication.

use async_trait::async_trait;
use futures_util::{Sink, Stream};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{http::Request, protocol::Message, Error as WsError},
};
use tracing::debug;

use crate::error::TransportError;

/// Path the device serves its RPC channel on.
pub const RPC_PATH: &str = "/rpc";

/// Anything that behaves like an open WebSocket.
pub trait WsIo:
    Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + Unpin
{
}

impl<T> WsIo for T where
    T: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + Unpin
{
}

/// An open socket, type-erased so connectors can hand back any stream.
pub type BoxedSocket = Box<dyn WsIo>;

/// Opens sockets for the connection manager.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<BoxedSocket, TransportError>;
}

/// Connects over TCP (or TLS for `wss://`) with tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<BoxedSocket, TransportError> {
        debug!(url = %url, "Connecting to WebSocket");

        if url.starts_with("wss://") {
            install_crypto_provider();
        }

        let request = Request::builder()
            .uri(url)
            .header("Host", extract_host(url))
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .body(())
            .map_err(|e| TransportError::Connection(format!("Failed to build request: {}", e)))?;

        let (ws, _) = connect_async_with_config(request, None, false)
            .await
            .map_err(|e| TransportError::Connection(format!("WebSocket connect failed: {}", e)))?;

        debug!(url = %url, "WebSocket connected");
        Ok(Box::new(ws))
    }
}

/// Make ring the process-wide rustls provider unless one is already set.
fn install_crypto_provider() {
    // Err only means a provider was installed first
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// `<host>/rpc`, with trailing slashes on the host dropped.
pub fn rpc_url(host: &str) -> String {
    format!("{}{}", host.trim_end_matches('/'), RPC_PATH)
}

/// Extract host from URL for Host header
fn extract_host(url: &str) -> &str {
    url.split("//")
        .nth(1)
        .and_then(|s| s.split('/').next())
        .unwrap_or("localhost")
}
