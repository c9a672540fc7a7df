//! # Retry
//!
//! Backoff between redeliveries of a released queue message.
use std::time;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Multiplier applied to `initial_interval` for every past attempt.
    pub backoff_coefficient: u32,
    /// Delay before the first redelivery.
    pub initial_interval: time::Duration,
    /// Upper bound on the delay, if any.
    pub maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval: None,
        }
    }

    pub fn with_maximum_interval(mut self, interval: time::Duration) -> Self {
        self.maximum_interval = Some(interval);
        self
    }

    /// Delay before redelivering a message that just failed its `attempt`-th delivery.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let factor = self
            .backoff_coefficient
            .saturating_pow(attempt.saturating_sub(1));
        let candidate = self.initial_interval.saturating_mul(factor);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate, max_interval),
            None => candidate,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, time::Duration::from_secs(1))
    }
}
