//! Error types for shelly-ws-transport

use thiserror::Error;

use crate::rpc::RpcError;

/// Close code reported when the socket went away without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Errors surfaced by the transport.
///
/// Cloneable so a single start outcome can be delivered to every caller
/// that is waiting on the same `begin()`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Lifecycle API misuse, e.g. `end()` while idle.
    #[error("Usage error: {0}")]
    Usage(String),

    /// The reconnect budget ran out before a connection could be kept open.
    #[error("Connection exhausted after {retries} retries (last close code {close_code})")]
    ConnectionExhausted { retries: u32, close_code: u16 },

    #[error("No hash function configured")]
    MissingHashFunction,

    /// An auth block was requested before the device issued a challenge.
    #[error("No authentication challenge has been received")]
    MissingChallenge,

    /// An auth block was requested before `authenticate()` was called.
    #[error("No credentials configured, call authenticate() first")]
    MissingCredentials,

    /// The frame could not be handed to an open socket.
    #[error("Not connected")]
    NotConnected,

    /// The pending start operation was abandoned by `end()`.
    #[error("Transport disconnected")]
    Disconnected,

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid host: {0}")]
    InvalidHost(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Error returned by the device, passed through unchanged.
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Protocol(e.to_string())
    }
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;
