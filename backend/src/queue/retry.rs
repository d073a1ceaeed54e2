use rand::Rng;
use std::time::Duration;

/// Exponential backoff with additive jitter, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(15),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following attempt number `retried` (0-based).
    pub fn delay(&self, retried: u32) -> Duration {
        self.base_delay(retried) + self.jitter()
    }

    fn base_delay(&self, retried: u32) -> Duration {
        let factor = 2u32.saturating_pow(retried.min(31));
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    fn jitter(&self) -> Duration {
        let bound = self.initial_delay.as_millis() as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..bound))
    }
}
