//! Device RPC runtime
//!
//! The boundary the transport plugs into. It knows how to frame requests and
//! correlate responses, but owns no socket: opening, closing and transmitting
//! are delegated to a [`TransportHooks`] implementation, and inbound frames are
//! pushed in through [`FrameReceiver`].
//!
//! | Module     | Responsibility                                  |
//! |------------|-------------------------------------------------|
//! | `protocol` | JSON frame encoding/decoding, challenge parsing |
//! | `engine`   | Request IDs, pending responses, notifications   |

mod engine;
mod protocol;

use futures_util::future::BoxFuture;

use crate::error::TransportError;

pub use engine::RpcEngine;
pub use protocol::{
    decode_inbound, AuthBlock, Challenge, Inbound, Nonce, Notification, RpcError, RpcRequest,
    AUTH_FAILURE_CODE,
};

/// Hooks a concrete transport implements for the RPC runtime.
pub trait TransportHooks: Send + Sync {
    /// Start opening the connection.
    ///
    /// The work must already be under way when this returns; the future only
    /// reports its outcome.
    fn on_begin(&self) -> BoxFuture<'static, Result<(), TransportError>>;

    /// Close the connection and stop any reconnection.
    ///
    /// The connection being closed is fixed when this returns; a later
    /// `on_begin` is never affected by the returned future.
    fn on_end(&self) -> BoxFuture<'static, Result<(), TransportError>>;

    /// Transmit one framed request. Returns false if nothing is open to send on.
    fn on_send(&self, frame: String) -> bool;
}

/// Entry point for raw inbound frames.
pub trait FrameReceiver: Send + Sync {
    fn receive(&self, raw: &str);

    /// The socket dropped; frames sent on it will get no response.
    fn connection_lost(&self) {}
}
