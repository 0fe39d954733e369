//! Local apply retry policy with exponential backoff.

use std::time::Duration;

use refsync_core::config::ConsumerConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ConsumerConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ConsumerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_millis(config.initial_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.backoff_multiplier,
        }
    }

    /// Whether another attempt follows the failed `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Backoff before the attempt following `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let delay = if millis.is_finite() && millis < self.max_delay.as_millis() as f64 {
            Duration::from_millis(millis as u64)
        } else {
            self.max_delay
        };
        delay.min(self.max_delay)
    }
}
