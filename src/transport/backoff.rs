// Exponential backoff: initial delay doubling per failure, capped per attempt.
// A policy with `max_elapsed` gives up once that much time has passed since the first attempt.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    /// `None` retries until the call succeeds or the transport closes.
    pub max_elapsed: Option<Duration>,
}

impl RetryPolicy {
    /// Used for aggregates, gauges, traces and logs: 1s, 2s, 4s ... 60s, for at most 60s.
    pub const fn bounded() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(60),
            max_elapsed: Some(Duration::from_secs(60)),
        }
    }

    /// Used for Init only: same curve with a lower cap and no overall limit.
    pub const fn until_successful() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(15),
            max_elapsed: None,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.initial_delay.min(self.max_delay),
            multiplier: self.multiplier.max(1),
            max_delay: self.max_delay,
        }
    }

    /// True once `elapsed` is past the overall limit.
    pub fn is_exhausted(&self, elapsed: Duration) -> bool {
        self.max_elapsed.is_some_and(|max| elapsed > max)
    }
}

/// Delay sequence for one call. Non-decreasing, never above `max_delay`.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    multiplier: u32,
    max_delay: Duration,
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self
            .next
            .checked_mul(self.multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        delay
    }
}
