use std::time::{Duration, Instant};

/// `max_retries` value meaning "never stop retrying".
pub const UNLIMITED_RETRIES: u16 = u16::MAX;

/// How a send should be retried after a failure.
///
/// No attempt, including the first, starts after `deadline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// [`UNLIMITED_RETRIES`] retries forever.
    pub max_retries: u16,
    pub retry_interval: Duration,
    /// If greater than `retry_interval`, the interval doubles after every retry up to this value.
    pub max_retry_interval: Duration,
    pub deadline: Option<Instant>,
}

impl RetryPolicy {
    pub const fn do_not_retry() -> Self {
        RetryPolicy {
            max_retries: 0,
            retry_interval: Duration::ZERO,
            max_retry_interval: Duration::ZERO,
            deadline: None,
        }
    }

    pub const fn retry_indefinitely(retry_interval: Duration, max_retry_interval: Duration) -> Self {
        RetryPolicy {
            max_retries: UNLIMITED_RETRIES,
            retry_interval,
            max_retry_interval,
            deadline: None,
        }
    }

    /// Retries indefinitely, starting at 100ms and backing off up to 10s.
    pub const fn client_default() -> Self {
        Self::retry_indefinitely(Duration::from_millis(100), Duration::from_secs(10))
    }

    /// Retries once after 50ms. Used when a server pushes to its subscribers.
    pub const fn server_client_default() -> Self {
        RetryPolicy {
            max_retries: 1,
            retry_interval: Duration::from_millis(50),
            max_retry_interval: Duration::from_millis(50),
            deadline: None,
        }
    }

    pub const fn with_deadline(self, deadline: Instant) -> Self {
        RetryPolicy {
            deadline: Some(deadline),
            ..self
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_retries == UNLIMITED_RETRIES
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Delays to wait before each retry.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            retries: 0,
            interval: self.retry_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::client_default()
    }
}

/// Yields the delay before retry `k` as `min(retry_interval * 2^k, max_retry_interval)`, and
/// stops after `max_retries` items. Deadlines are left to the caller.
///
/// When `max_retry_interval` is not above `retry_interval` the delay never grows and every item
/// is `retry_interval`.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    retries: u16,
    interval: Duration,
}

impl Backoff {
    pub fn retries(&self) -> u16 {
        self.retries
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if !self.policy.is_unlimited() {
            if self.retries >= self.policy.max_retries {
                return None;
            }
            self.retries += 1;
        } else {
            self.retries = self.retries.saturating_add(1);
        }
        let delay = self.interval;
        if self.policy.max_retry_interval > self.policy.retry_interval {
            self.interval = self
                .interval
                .checked_mul(2)
                .unwrap_or(self.policy.max_retry_interval)
                .min(self.policy.max_retry_interval);
        }
        Some(delay)
    }
}
