//! Reconnection budget and backoff.

use std::time::Duration;

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReconnectDecision {
    /// Try again after `delay`; `attempt` is 1-based.
    Retry { attempt: u32, delay: Duration },
    /// Budget exhausted; close the connection for good.
    GiveUp { attempts: u32 },
}

/// Counts consecutive failed connection attempts and spaces them out with
/// exponential backoff.
#[derive(Debug)]
pub(crate) struct ReconnectionController {
    /// Negative means unlimited.
    max_reconnections: i32,
    attempts: u32,
    base_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
}

impl ReconnectionController {
    pub(crate) fn new(max_reconnections: i32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_reconnections,
            attempts: 0,
            base_delay,
            current_delay: base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// A transport was lost or an attempt to establish one failed.
    pub(crate) fn on_failure(&mut self) -> ReconnectDecision {
        self.attempts += 1;
        if self.max_reconnections >= 0 && self.attempts > self.max_reconnections as u32 {
            warn!(attempts = self.attempts - 1, "reconnection limit reached");
            return ReconnectDecision::GiveUp {
                attempts: self.attempts - 1,
            };
        }

        let delay = self.current_delay;
        // Exponential backoff: double the delay up to max.
        self.current_delay = (self.current_delay * 2).min(self.max_delay);
        debug!(attempt = self.attempts, ?delay, "scheduling reconnection");
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay,
        }
    }

    /// The connection reached `Connected`; restore the full budget.
    pub(crate) fn on_connected(&mut self) {
        self.attempts = 0;
        self.current_delay = self.base_delay;
    }

    #[cfg(test)]
    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }
}
