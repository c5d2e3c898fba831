//! Reconnect backoff policy: linear growth with a clamp and an attempt ceiling.

use crate::config::ClientConfig;
use std::time::Duration;

/// Bounded linear backoff. Attempt `n` (1-based) waits
/// `min(delay * n, delay_max)`; after `max_attempts` the policy yields
/// nothing and the caller must wait for a fresh trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub delay_max: Duration,
    pub max_attempts: u32,
    pub auto_reconnect: bool,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            delay: config.reconnect_delay,
            delay_max: config.reconnect_delay_max,
            max_attempts: config.max_reconnect_attempts,
            auto_reconnect: config.auto_reconnect,
        }
    }

    /// Delay before the given 1-based attempt, or `None` when reconnection
    /// is disabled or the ceiling is reached.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if !self.auto_reconnect || attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        Some(self.delay.saturating_mul(attempt).min(self.delay_max))
    }
}
