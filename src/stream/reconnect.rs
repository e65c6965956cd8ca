//! Reconnect backoff decisions for the stream client.

use std::time::Duration;

use crate::config::PortalDefaults;

/// Growth of the reconnect delay stops at this multiple of the base interval.
pub const MAX_BACKOFF_MULTIPLIER: u32 = 5;

/// Outcome of [`ReconnectPolicy::next_delay`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReconnectDecision {
    /// Schedule another connection attempt after the delay.
    Retry(Duration),
    /// Stop retrying; the client settles in `Disconnected`.
    GiveUp,
}

/// Linear backoff capped at `MAX_BACKOFF_MULTIPLIER` times the base interval,
/// with a hard ceiling on the number of attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReconnectPolicy {
    pub base_interval: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_interval: Duration, max_attempts: u32) -> Self {
        Self {
            base_interval,
            max_attempts,
        }
    }

    /// Decides what to do before reconnect attempt `attempt` (1-based).
    pub fn next_delay(&self, attempt: u32) -> ReconnectDecision {
        let attempt = attempt.max(1);
        if attempt > self.max_attempts {
            return ReconnectDecision::GiveUp;
        }
        let multiplier = attempt.min(MAX_BACKOFF_MULTIPLIER);
        ReconnectDecision::Retry(self.base_interval.saturating_mul(multiplier))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(
            PortalDefaults::RECONNECT_INTERVAL,
            PortalDefaults::MAX_RECONNECT_ATTEMPTS,
        )
    }
}
