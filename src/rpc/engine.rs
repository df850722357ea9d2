//! Request/response correlation for the device RPC channel.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use super::protocol::{decode_inbound, AuthBlock, Inbound, Notification, RpcError, RpcRequest};
use super::{FrameReceiver, TransportHooks};
use crate::error::TransportError;

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>;

/// Notifications buffered per subscriber before the oldest are dropped.
const NOTIFICATION_CAPACITY: usize = 64;

/// Frames requests, tracks them by ID and routes responses back to callers.
///
/// Holds no socket. Outgoing frames are handed to a [`TransportHooks`]
/// implementation and inbound frames arrive through [`FrameReceiver`].
pub struct RpcEngine {
    client_id: String,
    request_timeout: Option<Duration>,
    next_id: AtomicU64,
    pending: Mutex<PendingMap>,
    notifications: broadcast::Sender<Notification>,
}

impl RpcEngine {
    pub fn new(client_id: impl Into<String>, request_timeout: Option<Duration>) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            client_id: client_id.into(),
            request_timeout,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            notifications,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Subscribe to unsolicited notifications from the device.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Send one request and wait for its response.
    ///
    /// # Errors
    /// - `NotConnected` if the hooks refused the frame
    /// - `Rpc` if the device answered with an error object
    /// - `Timeout` if the configured request timeout elapsed
    /// - `Disconnected` if pending requests were failed by `fail_pending`
    pub async fn request(
        &self,
        hooks: &dyn TransportHooks,
        method: &str,
        params: Option<Value>,
        auth: Option<AuthBlock>,
    ) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = RpcRequest {
            id,
            src: self.client_id.clone(),
            method: method.to_string(),
            params,
            auth,
        }
        .encode()?;

        let (response_tx, response_rx) = oneshot::channel();
        self.lock_pending().insert(id, response_tx);

        debug!(id = id, method = %method, "Sending RPC request");

        if !hooks.on_send(frame) {
            self.lock_pending().remove(&id);
            return Err(TransportError::NotConnected);
        }

        let outcome = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, response_rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.lock_pending().remove(&id);
                    return Err(TransportError::Timeout(format!(
                        "{} (id {}) after {:?}",
                        method, id, limit
                    )));
                }
            },
            None => response_rx.await,
        };

        match outcome {
            Ok(result) => result.map_err(TransportError::Rpc),
            Err(_) => Err(TransportError::Disconnected),
        }
    }

    /// Drop every pending request; their callers observe `Disconnected`.
    pub fn fail_pending(&self) {
        let drained: Vec<u64> = self.lock_pending().drain().map(|(id, _)| id).collect();
        for id in drained {
            debug!(id = id, "Abandoning pending request");
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingMap> {
        // A poisoned map only means another caller panicked mid-insert.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl FrameReceiver for RpcEngine {
    fn receive(&self, raw: &str) {
        match decode_inbound(raw) {
            Ok(Inbound::Response { id, result }) => match self.lock_pending().remove(&id) {
                Some(tx) => {
                    let _ = tx.send(result);
                }
                None => debug!(id = id, "Response for unknown request"),
            },
            Ok(Inbound::Notification(notification)) => {
                debug!(method = %notification.method, "Received notification");
                // No subscribers is not an error
                let _ = self.notifications.send(notification);
            }
            Err(e) => warn!(error = %e, "Failed to decode inbound frame"),
        }
    }

    fn connection_lost(&self) {
        let in_flight = self.pending_count();
        if in_flight > 0 {
            warn!(in_flight = in_flight, "Connection lost with requests in flight");
        }
        self.fail_pending();
    }
}
