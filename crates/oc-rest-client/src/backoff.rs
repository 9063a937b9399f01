//! Capped exponential backoff shared by request retry and stream reconnect

use std::time::Duration;

/// Upper bound on a single request retry delay
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Upper bound on a single reconnect delay
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(5 * 60);

/// `base * 2^attempt`, capped at `max`. `attempt` is 0-indexed.
pub fn exponential_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let shift = attempt.min(31);
    let multiplier = 1_u32 << shift;
    base.checked_mul(multiplier).unwrap_or(max).min(max)
}

/// Reconnect bookkeeping for one reconnect run.
///
/// The delay starts at the configured reconnect delay and doubles after each
/// failed attempt, never exceeding [`MAX_RECONNECT_DELAY`].
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    current_delay: Duration,
    attempt: u32,
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(initial_delay: Duration, max_attempts: u32) -> Self {
        Self {
            current_delay: initial_delay.min(MAX_RECONNECT_DELAY),
            attempt: 0,
            max_attempts,
        }
    }

    /// Start the next attempt. Returns its 1-based number, or `None` once the
    /// budget is spent.
    pub fn next_attempt(&mut self) -> Option<u32> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.attempt)
    }

    /// Delay to wait after a failed attempt; advances the policy.
    pub fn on_failure(&mut self) -> Duration {
        let delay = self.current_delay;
        self.current_delay = self
            .current_delay
            .checked_mul(2)
            .unwrap_or(MAX_RECONNECT_DELAY)
            .min(MAX_RECONNECT_DELAY);
        delay
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}
