//! Transport Lifecycle
//!
//! Single responsibility: At most one start attempt per transport.
//!
//! # The Key Abstraction
//!
//! `begin()` hands out a [`StartHandle`], a cloneable future for the one
//! connection attempt in flight. Calling `begin()` again while a handle is
//! stored returns a clone of the same handle, so every caller observes the
//! outcome of a single attempt. `end()` drops the handle and closes the
//! connection; the next `begin()` starts over.
//!
//! A failed attempt stays stored until `end()`, so later `begin()` calls
//! observe the same failure instead of silently retrying.

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tracing::{debug, info};

use crate::error::TransportError;
use crate::rpc::TransportHooks;

/// Shared outcome of one start attempt.
#[derive(Clone)]
pub struct StartHandle {
    inner: Shared<BoxFuture<'static, Result<(), TransportError>>>,
}

impl StartHandle {
    fn new(future: BoxFuture<'static, Result<(), TransportError>>) -> Self {
        Self {
            inner: future.shared(),
        }
    }

    /// Whether both handles refer to the same start attempt.
    pub fn is_same(&self, other: &StartHandle) -> bool {
        self.inner.ptr_eq(&other.inner)
    }

    /// The outcome, if the attempt has already completed.
    pub fn outcome(&self) -> Option<Result<(), TransportError>> {
        self.inner.peek().cloned()
    }
}

impl Future for StartHandle {
    type Output = Result<(), TransportError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

/// Observable lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Idle,
    Starting,
    Active,
}

enum Phase {
    Idle,
    Starting(StartHandle),
    Active(StartHandle),
}

struct LifecycleState {
    phase: Phase,
    /// Bumped on every begin/end so a stale attempt cannot promote a newer one.
    epoch: u64,
}

/// Wraps a set of [`TransportHooks`] with begin/end deduplication.
pub struct Lifecycle<H: TransportHooks> {
    host: String,
    hooks: Arc<H>,
    state: Arc<Mutex<LifecycleState>>,
}

impl<H: TransportHooks + 'static> Lifecycle<H> {
    pub fn new(host: impl Into<String>, hooks: Arc<H>) -> Self {
        Self {
            host: host.into(),
            hooks,
            state: Arc::new(Mutex::new(LifecycleState {
                phase: Phase::Idle,
                epoch: 0,
            })),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn hooks(&self) -> &Arc<H> {
        &self.hooks
    }

    pub fn phase(&self) -> LifecyclePhase {
        match lock(&self.state).phase {
            Phase::Idle => LifecyclePhase::Idle,
            Phase::Starting(_) => LifecyclePhase::Starting,
            Phase::Active(_) => LifecyclePhase::Active,
        }
    }

    /// Start the transport, or join the start already in progress.
    pub fn begin(&self) -> StartHandle {
        let mut state = lock(&self.state);

        match &state.phase {
            Phase::Starting(handle) | Phase::Active(handle) => {
                debug!(host = %self.host, "Joining existing start");
                return handle.clone();
            }
            Phase::Idle => {}
        }

        state.epoch += 1;
        let epoch = state.epoch;
        info!(host = %self.host, "Starting transport");

        let attempt = self.hooks.on_begin();
        let shared_state = Arc::clone(&self.state);
        let handle = StartHandle::new(
            async move {
                let outcome = attempt.await;
                if outcome.is_ok() {
                    promote(&shared_state, epoch);
                }
                outcome
            }
            .boxed(),
        );

        state.phase = Phase::Starting(handle.clone());
        handle
    }

    /// Stop the transport.
    ///
    /// # Errors
    /// `Usage` if the transport is idle.
    pub async fn end(&self) -> Result<(), TransportError> {
        // Close is started under the lock: it only ever targets the
        // connection begun before this end(), never one begun after it.
        let closing = {
            let mut state = lock(&self.state);
            if let Phase::Idle = state.phase {
                return Err(TransportError::Usage(
                    "end() called on a transport that was not started".into(),
                ));
            }
            state.phase = Phase::Idle;
            state.epoch += 1;
            self.hooks.on_end()
        };

        info!(host = %self.host, "Ending transport");
        closing.await
    }
}

fn lock(state: &Mutex<LifecycleState>) -> MutexGuard<'_, LifecycleState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn promote(state: &Mutex<LifecycleState>, epoch: u64) {
    let mut state = lock(state);
    if state.epoch != epoch {
        return;
    }
    let phase = std::mem::replace(&mut state.phase, Phase::Idle);
    state.phase = match phase {
        Phase::Starting(handle) => Phase::Active(handle),
        other => other,
    };
}
