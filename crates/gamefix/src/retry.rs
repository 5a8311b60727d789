//! Retry policies for polling during game startup.

use std::time::Duration;

/// Decides whether and when to try again after a failed attempt.
pub trait RetryStrategy: Send + Sync {
    /// Delay before retry number `retry` (1 for the first retry), or `None`
    /// to give up.
    fn next_delay(&self, retry: u32) -> Option<Duration>;
}

/// Try once.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    fn next_delay(&self, _retry: u32) -> Option<Duration> {
        None
    }
}

/// Same delay every time, up to `max_retries` retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    pub delay: Duration,
    pub max_retries: u32,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        Self { delay, max_retries }
    }
}

impl RetryStrategy for FixedDelay {
    fn next_delay(&self, retry: u32) -> Option<Duration> {
        (retry <= self.max_retries).then_some(self.delay)
    }
}

/// Doubling delay starting at `initial`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            initial,
            max_delay,
            max_retries,
        }
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }
        let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
        Some(
            self.initial
                .checked_mul(factor)
                .map_or(self.max_delay, |delay| delay.min(self.max_delay)),
        )
    }
}
