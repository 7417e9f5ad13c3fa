//! Reconnection policy after a closed session.
//!
//! Every non-terminal closure schedules exactly one retry after a fixed
//! delay. There is no attempt counter and no backoff growth: each closure
//! decides independently. A logged-out closure is terminal.

use std::time::Duration;

use crate::protocol::CloseReason;

/// Default delay before reconnecting.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// What to do after a closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Schedule one reconnect attempt after the delay.
    Retry(Duration),
    /// Credentials are invalid; wait for a manual `initialize()`.
    Stop,
}

/// Fixed-delay single-shot reconnect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    delay: Duration,
}

impl ReconnectPolicy {
    /// Create a policy retrying after `delay`.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Delay applied to retries.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Decide how to react to a closure.
    pub fn decide(&self, reason: &CloseReason) -> ReconnectDecision {
        if reason.is_logged_out() {
            ReconnectDecision::Stop
        } else {
            ReconnectDecision::Retry(self.delay)
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_DELAY)
    }
}
