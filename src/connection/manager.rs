//! Connection Manager
//!
//! Single responsibility: Keep one socket open to the device, reconnecting after
//! unexpected closes until the retry budget runs out.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              ConnectionManager               │
//! │  connect() / disconnect() / send()           │
//! └──────────────────────────────────────────────┘
//!          │ shutdown (watch)   │ frames (mpsc)
//!          ▼                    ▼
//! ┌──────────────────────────────────────────────┐
//! │            Driver task (one per run)         │
//! │  open → pump frames → close → backoff → open │
//! └──────────────────────────────────────────────┘
//!          │ inbound text frames, connection lost
//!          ▼
//!    FrameReceiver (RPC runtime)
//! ```
//!
//! All socket-driven state changes happen inside the driver task, so a close
//! event, a backoff timer and a caller's `disconnect()` are never handled
//! concurrently. `disconnect()` raises the forced flag through a watch channel;
//! the driver checks it when a timer fires, not when the timer was scheduled.
//!
//! Every `connect()` starts a new run with its own id. Only the newest run
//! publishes state and retries, so a driver that is still shutting down, or a
//! `disconnect()` finishing late, never overwrites what a newer run reported.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};

use super::policy::ReconnectPolicy;
use super::socket::{BoxedSocket, Connector};
use crate::error::{TransportError, ABNORMAL_CLOSURE};
use crate::rpc::{FrameReceiver, TransportHooks};

/// Close code reported for a close frame without a status.
const NO_STATUS_RECEIVED: u16 = 1005;

/// State of the physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting for the backoff timer before the next attempt.
    Reconnecting,
    /// Retry budget exhausted.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Fields the driver writes and the manager reads.
struct Shared {
    state: watch::Sender<ConnectionState>,
    retries: AtomicU32,
    /// Id of the run allowed to publish.
    current_run: Mutex<u64>,
}

impl Shared {
    /// Claim publishing for a new run and return its id.
    fn next_run(&self) -> u64 {
        let mut current = self.lock_current();
        *current += 1;
        *current
    }

    /// Publish `state` and `retries` if `run` is still the newest run.
    fn publish(&self, run: u64, state: ConnectionState, retries: u32) {
        let current = self.lock_current();
        if *current != run {
            debug!(run = run, state = %state, "Dropping state from a retired run");
            return;
        }
        self.retries.store(retries, Ordering::SeqCst);
        self.state.send_replace(state);
    }

    fn lock_current(&self) -> MutexGuard<'_, u64> {
        self.current_run.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handles to a running driver task.
struct Run {
    id: u64,
    shutdown: watch::Sender<bool>,
    outbound: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

/// Owns the device socket and its reconnect loop.
pub struct ConnectionManager {
    url: String,
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    receiver: Arc<dyn FrameReceiver>,
    shared: Arc<Shared>,
    run: Mutex<Option<Run>>,
}

impl ConnectionManager {
    pub fn new(
        url: impl Into<String>,
        policy: ReconnectPolicy,
        connector: Arc<dyn Connector>,
        receiver: Arc<dyn FrameReceiver>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            url: url.into(),
            policy,
            connector,
            receiver,
            shared: Arc::new(Shared {
                state,
                retries: AtomicU32::new(0),
                current_run: Mutex::new(0),
            }),
            run: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Reconnects scheduled since the last successful open.
    pub fn retries(&self) -> u32 {
        self.shared.retries.load(Ordering::SeqCst)
    }

    /// Start the connect loop.
    ///
    /// The loop runs on its own task from this point on. The returned future
    /// resolves on the first successful open, fails with `ConnectionExhausted`
    /// once the retry budget is spent, and fails with `Disconnected` if
    /// `disconnect()` stops the loop first. Must be called within a Tokio runtime.
    pub fn connect(&self) -> BoxFuture<'static, Result<(), TransportError>> {
        let (done_tx, done_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let run_id = self.shared.next_run();

        let driver = Driver {
            url: self.url.clone(),
            policy: self.policy,
            connector: Arc::clone(&self.connector),
            receiver: Arc::clone(&self.receiver),
            shared: Arc::clone(&self.shared),
            run_id,
            retries: 0,
            shutdown: shutdown_rx,
            outbound: outbound_rx,
            done: Some(done_tx),
        };

        let task = tokio::spawn(driver.run());

        let previous = self.lock_run().replace(Run {
            id: run_id,
            shutdown: shutdown_tx,
            outbound: outbound_tx,
            task,
        });
        if let Some(previous) = previous {
            warn!(url = %self.url, "Replacing a connect loop that was never stopped");
            let _ = previous.shutdown.send(true);
        }

        Box::pin(async move { done_rx.await.unwrap_or(Err(TransportError::Disconnected)) })
    }

    /// Stop reconnecting and close the socket.
    ///
    /// The run to stop is taken and signalled before this returns; the future
    /// resolves once its driver task has exited. Safe in any state and
    /// idempotent. A `connect()` issued after this call is left alone.
    pub fn disconnect(&self) -> BoxFuture<'static, Result<(), TransportError>> {
        let run = self.lock_run().take();
        let shared = Arc::clone(&self.shared);
        let url = self.url.clone();

        if let Some(run) = &run {
            debug!(url = %url, run = run.id, "Forced disconnect");
            let _ = run.shutdown.send(true);
        }

        Box::pin(async move {
            if let Some(run) = run {
                drop(run.outbound);
                if let Err(e) = run.task.await {
                    warn!(error = %e, "Connection driver ended abnormally");
                }
                shared.publish(run.id, ConnectionState::Disconnected, 0);
            }
            Ok(())
        })
    }

    /// Hand one framed request to the open socket.
    ///
    /// Returns false if no socket is open. Never queues for a later connection.
    pub fn send(&self, frame: String) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        match self.lock_run().as_ref() {
            Some(run) => run.outbound.send(frame).is_ok(),
            None => false,
        }
    }

    fn lock_run(&self) -> MutexGuard<'_, Option<Run>> {
        self.run.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TransportHooks for ConnectionManager {
    fn on_begin(&self) -> BoxFuture<'static, Result<(), TransportError>> {
        self.connect()
    }

    fn on_end(&self) -> BoxFuture<'static, Result<(), TransportError>> {
        self.disconnect()
    }

    fn on_send(&self, frame: String) -> bool {
        self.send(frame)
    }
}

/// How a socket session ended.
enum Exit {
    Forced,
    Closed(u16),
}

/// The per-run actor. Owns the socket for as long as it is open.
struct Driver {
    url: String,
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    receiver: Arc<dyn FrameReceiver>,
    shared: Arc<Shared>,
    run_id: u64,
    retries: u32,
    shutdown: watch::Receiver<bool>,
    outbound: mpsc::UnboundedReceiver<String>,
    done: Option<oneshot::Sender<Result<(), TransportError>>>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            if self.forced() {
                break;
            }

            self.publish(ConnectionState::Connecting);
            info!(url = %self.url, "Connecting to device");

            let opened = tokio::select! {
                _ = self.shutdown.changed() => break,
                opened = self.connector.open(&self.url) => opened,
            };

            let close_code = match opened {
                Ok(socket) => {
                    self.on_open();
                    match self.pump(socket).await {
                        Exit::Forced => break,
                        Exit::Closed(code) => code,
                    }
                }
                Err(e) => {
                    warn!(url = %self.url, error = %e, "Failed to open connection");
                    ABNORMAL_CLOSURE
                }
            };

            if self.forced() {
                break;
            }

            let exhausted = !self.policy.allows_retry(self.retries);
            if exhausted {
                self.publish(ConnectionState::Failed);
            } else {
                self.retries += 1;
                self.publish(ConnectionState::Reconnecting);
            }

            self.drop_unsent();
            self.receiver.connection_lost();

            if exhausted {
                error!(
                    url = %self.url,
                    retries = self.retries,
                    close_code = close_code,
                    "Reconnect attempts exhausted"
                );
                self.finish(Err(TransportError::ConnectionExhausted {
                    retries: self.retries,
                    close_code,
                }));
                return;
            }

            let delay = self.policy.delay_for(self.retries);
            warn!(
                url = %self.url,
                retries = self.retries,
                max_retries = %self.policy.max_retries,
                close_code = close_code,
                delay = ?delay,
                "Connection closed, scheduling reconnect"
            );

            tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!(url = %self.url, "Connection driver stopped");
    }

    fn forced(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn publish(&self, state: ConnectionState) {
        self.shared.publish(self.run_id, state, self.retries);
    }

    /// Frames queued for a dead socket are never replayed on the next one.
    fn drop_unsent(&mut self) {
        let mut dropped = 0usize;
        while self.outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(url = %self.url, dropped = dropped, "Dropped unsent frames");
        }
    }

    fn on_open(&mut self) {
        self.drop_unsent();
        self.retries = 0;
        self.publish(ConnectionState::Connected);
        info!(url = %self.url, "Connected to device");
        self.finish(Ok(()));
    }

    /// Resolve the outstanding connect operation. Later calls are no-ops.
    fn finish(&mut self, outcome: Result<(), TransportError>) {
        if let Some(done) = self.done.take() {
            let _ = done.send(outcome);
        }
    }

    async fn pump(&mut self, socket: BoxedSocket) -> Exit {
        let (mut sink, mut stream) = socket.split();

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    debug!(url = %self.url, "Closing socket");
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    return Exit::Forced;
                }
                Some(frame) = self.outbound.recv() => {
                    debug!(bytes = frame.len(), "Sending frame");
                    if let Err(e) = sink.send(Message::Text(frame)).await {
                        warn!(url = %self.url, error = %e, "Failed to send frame, dropping socket");
                        return Exit::Closed(ABNORMAL_CLOSURE);
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.receiver.receive(&text),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => self.receiver.receive(&text),
                        Err(e) => warn!(error = %e, "Dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame
                            .map(|f| u16::from(f.code))
                            .unwrap_or(NO_STATUS_RECEIVED);
                        info!(url = %self.url, close_code = code, "Device closed connection");
                        return Exit::Closed(code);
                    }
                    Some(Ok(_)) => {
                        // Ping/pong handled by tungstenite
                    }
                    Some(Err(e)) => {
                        warn!(url = %self.url, error = %e, "WebSocket error");
                        return Exit::Closed(ABNORMAL_CLOSURE);
                    }
                    None => {
                        info!(url = %self.url, "Connection dropped");
                        return Exit::Closed(ABNORMAL_CLOSURE);
                    }
                },
            }
        }
    }
}
