//! Exponential-backoff retry policy for provider calls.

use std::time::Duration;
use tracing::warn;

/// Retry schedule for transient provider failures. Attempt numbering is
/// 1-based; `delay_for(1)` is the pause after the first failure.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Backoff before attempt `attempt + 1`: base * 2^(attempt-1), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }

    /// Sleep out the backoff for `attempt`, logging the pause.
    pub async fn wait(&self, attempt: u32) {
        let delay = self.delay_for(attempt);
        warn!(attempt, delay_ms = delay.as_millis() as u64, "provider call failed, backing off");
        tokio::time::sleep(delay).await;
    }
}
