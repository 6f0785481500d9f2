//! Connection retry policy.

use crate::config::{RetryStrategy, SyncSettings};
use std::time::Duration;

/// Bounded retry with exponential or fixed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: RetryStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&SyncSettings::default())
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            max_attempts: settings.max_connect_attempts,
            base_delay: Duration::from_millis(settings.retry_base_delay_ms),
            max_delay: Duration::from_millis(settings.retry_max_delay_ms),
            strategy: settings.retry_strategy,
        }
    }

    /// Fixed delay between a bounded number of attempts.
    #[must_use]
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: RetryStrategy::Fixed,
        }
    }

    /// Delay after failed attempt `attempt` (1-based).
    ///
    /// Exponential: `min(base * 2^(attempt-1), max)`. Fixed: `base`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.strategy {
            RetryStrategy::Fixed => self.base_delay,
            RetryStrategy::Exponential => {
                let exponent = attempt.saturating_sub(1).min(31);
                self.base_delay
                    .checked_mul(1u32 << exponent)
                    .map_or(self.max_delay, |d| d.min(self.max_delay))
            }
        }
    }
}
