//! Per-connection lifecycle bookkeeping shared by both protocols.
//!
//! Tracks the Active → ShuttingDown → Closed progression, counts in-flight
//! dispatches and invocations with RAII guards, and carries the two
//! cancellation fans: one propagated into every dispatch token, one that
//! fails in-flight invocations with a recorded reason.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use floe_types::Error;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    ShuttingDown,
    Closed,
}

type PeerShutdownCallback = Box<dyn FnOnce(&str) + Send>;

pub(crate) struct Lifecycle {
    state: Mutex<ConnectionState>,
    invocations: AtomicUsize,
    dispatches: AtomicUsize,
    idle: Notify,
    dispatch_cancel: CancellationToken,
    invocation_abort: CancellationToken,
    abort_reason: Mutex<Option<Error>>,
    peer_shutdown: Mutex<Option<PeerShutdownCallback>>,
}

impl Lifecycle {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ConnectionState::Active),
            invocations: AtomicUsize::new(0),
            dispatches: AtomicUsize::new(0),
            idle: Notify::new(),
            dispatch_cancel: CancellationToken::new(),
            invocation_abort: CancellationToken::new(),
            abort_reason: Mutex::new(None),
            peer_shutdown: Mutex::new(None),
        })
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Move Active → ShuttingDown. Idempotent; returns false once Closed.
    pub(crate) fn begin_shutdown(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            ConnectionState::Active => {
                *state = ConnectionState::ShuttingDown;
                true
            }
            ConnectionState::ShuttingDown => true,
            ConnectionState::Closed => false,
        }
    }

    pub(crate) fn close(&self) {
        *self.state.lock() = ConnectionState::Closed;
    }

    /// Begin an invocation; fails unless the connection is Active.
    ///
    /// The counter increment happens under the state lock so a shutdown that
    /// observed the transition never misses an in-flight operation.
    pub(crate) fn try_begin_invocation(self: &Arc<Self>) -> Option<OpGuard> {
        let state = self.state.lock();
        if *state != ConnectionState::Active {
            return None;
        }
        self.invocations.fetch_add(1, Ordering::AcqRel);
        drop(state);
        Some(OpGuard {
            lifecycle: self.clone(),
            kind: OpKind::Invocation,
        })
    }

    /// Begin a dispatch; refused unless the connection is Active.
    pub(crate) fn try_begin_dispatch(self: &Arc<Self>) -> Option<OpGuard> {
        let state = self.state.lock();
        if *state != ConnectionState::Active {
            return None;
        }
        self.dispatches.fetch_add(1, Ordering::AcqRel);
        drop(state);
        Some(OpGuard {
            lifecycle: self.clone(),
            kind: OpKind::Dispatch,
        })
    }

    pub(crate) fn has_invocations_in_progress(&self) -> bool {
        self.invocations.load(Ordering::Acquire) > 0
    }

    pub(crate) fn has_dispatches_in_progress(&self) -> bool {
        self.dispatches.load(Ordering::Acquire) > 0
    }

    /// Wait until both in-flight counters reach zero.
    pub(crate) async fn wait_idle(&self) {
        loop {
            if !self.has_invocations_in_progress() && !self.has_dispatches_in_progress() {
                return;
            }
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.has_invocations_in_progress() && !self.has_dispatches_in_progress() {
                return;
            }
            notified.await;
        }
    }

    /// Token handed (as child tokens) to every dispatch.
    pub(crate) fn dispatch_token(&self) -> CancellationToken {
        self.dispatch_cancel.child_token()
    }

    pub(crate) fn cancel_dispatches(&self) {
        self.dispatch_cancel.cancel();
    }

    /// Fail in-flight invocations with `reason`. The first reason sticks.
    pub(crate) fn abort_invocations(&self, reason: Error) {
        {
            let mut slot = self.abort_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.invocation_abort.cancel();
    }

    pub(crate) fn aborted(&self) -> CancellationToken {
        self.invocation_abort.clone()
    }

    pub(crate) fn abort_reason(&self) -> Error {
        self.abort_reason
            .lock()
            .clone()
            .unwrap_or(Error::ConnectionClosed)
    }

    pub(crate) fn set_peer_shutdown(&self, callback: PeerShutdownCallback) {
        *self.peer_shutdown.lock() = Some(callback);
    }

    /// Invoke the peer-shutdown callback, once.
    pub(crate) fn notify_peer_shutdown(&self, message: &str) {
        let callback = self.peer_shutdown.lock().take();
        if let Some(callback) = callback {
            callback(message);
        }
    }
}

enum OpKind {
    Invocation,
    Dispatch,
}

/// RAII guard for one in-flight operation.
pub(crate) struct OpGuard {
    lifecycle: Arc<Lifecycle>,
    kind: OpKind,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        let counter = match self.kind {
            OpKind::Invocation => &self.lifecycle.invocations,
            OpKind::Dispatch => &self.lifecycle.dispatches,
        };
        counter.fetch_sub(1, Ordering::AcqRel);
        if !self.lifecycle.has_invocations_in_progress()
            && !self.lifecycle.has_dispatches_in_progress()
        {
            self.lifecycle.idle.notify_waiters();
        }
    }
}
