//! Device Connection Module
//!
//! Owns the physical WebSocket to the device.
//!
//! | Module    | Responsibility                                  |
//! |-----------|-------------------------------------------------|
//! | `socket`  | Opening a WebSocket (`Connector`)               |
//! | `policy`  | Retry budget and backoff formula                |
//! | `manager` | Connect loop, reconnects, forced disconnect     |
//!
//! Nothing here knows about RPC framing or authentication. Inbound text frames
//! are handed to a [`FrameReceiver`](crate::rpc::FrameReceiver) and state
//! changes are published on a watch channel.

mod manager;
mod policy;
mod socket;

pub use manager::{ConnectionManager, ConnectionState};
pub use policy::{
    ReconnectPolicy, RetryLimit, BASE_DELAY, DEFAULT_RECONNECT_RETRIES, UNLIMITED_RETRIES,
};
pub use socket::{rpc_url, BoxedSocket, Connector, WsConnector, WsIo, RPC_PATH};
