//! Shelly WS Transport - Resilient, authenticating WebSocket transport for device RPC
//!
//! Talks JSON-RPC to a device over `ws://<host>/rpc`, keeps the socket open
//! across drops, and answers the device's digest challenges.
//!
//! ## Architecture
//!
//! | Layer | Module | Does |
//! |-------|--------|------|
//! | Lifecycle | `lifecycle` | `begin`/`end` with a single shared start attempt |
//! | Connection | `connection` | Socket, reconnect loop, backoff |
//! | Authentication | `auth` | User token, per-request proofs |
//! | Interceptor | `transport` | Attaches auth blocks, captures 401 challenges |
//! | RPC runtime | `rpc` | Framing, request IDs, response routing |
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use shelly_ws_transport::{Sha256Hasher, Transport, TransportConfig};
//!
//! # async fn run() -> Result<(), shelly_ws_transport::TransportError> {
//! let transport = Transport::builder(TransportConfig::for_host("ws://192.168.1.20"))
//!     .hasher(Arc::new(Sha256Hasher))
//!     .build()?;
//!
//! transport.begin().await?;
//! transport.authenticate("shellypro1-8cb1", "secret").await?;
//! let status = transport.rpc_request("Shelly.GetStatus", None).await?;
//! println!("{}", status);
//! transport.end().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod lifecycle;
pub mod rpc;
pub mod transport;

// Re-exports
pub use auth::{AuthHandler, DigestHasher, Sha256Hasher};
pub use config::TransportConfig;
pub use connection::{
    ConnectionManager, ConnectionState, Connector, ReconnectPolicy, RetryLimit, WsConnector,
};
pub use error::{Result, TransportError};
pub use lifecycle::{LifecyclePhase, StartHandle};
pub use rpc::{Challenge, Notification, RpcError};
pub use transport::{Transport, TransportBuilder};
