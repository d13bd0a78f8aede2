//! Retry guidance written by connections, read by retry interceptors.

use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a retry interceptor may do with a failed request.
///
/// Set by the connection based on where the failure occurred: failures before
/// anything reached the wire are retryable immediately; failures after the
/// request was observably dispatched are only retryable for idempotent
/// requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Do not retry.
    #[default]
    NoRetry,
    /// Safe to re-drive on the same or another connection right away.
    Immediately,
    /// Retry, but not on the endpoint that failed.
    OtherReplica,
    /// Retry after the given delay.
    AfterDelay(Duration),
}

/// Shared policy cell attached to an outgoing request.
///
/// One writer (the connection that last handled the request), one reader
/// (the caller's retry interceptor). Clone the handle before handing the
/// request to `invoke`.
#[derive(Debug, Clone, Default)]
pub struct RetryHint {
    policy: Arc<Mutex<RetryPolicy>>,
}

impl RetryHint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, policy: RetryPolicy) {
        *self.policy.lock().unwrap() = policy;
    }

    pub fn get(&self) -> RetryPolicy {
        *self.policy.lock().unwrap()
    }
}
