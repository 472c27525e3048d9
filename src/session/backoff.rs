//! Reconnect backoff policy.

use std::time::Duration;

use crate::config::SessionConfig;

/// Linear backoff with a cap, a bounded number of consecutive attempts, and
/// a stability window that resets the count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub stable_after: Duration,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based): `min(base * attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.max(1)).min(self.max_delay)
    }

    /// Whether `attempt` consecutive failures exhaust the policy.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }

    /// Whether a connection that stayed open this long resets the count.
    pub fn is_stable(&self, open_for: Duration) -> bool {
        open_for >= self.stable_after
    }
}

impl From<&SessionConfig> for ReconnectPolicy {
    fn from(config: &SessionConfig) -> Self {
        Self {
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            max_attempts: config.max_attempts,
            stable_after: config.stable_after,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}
