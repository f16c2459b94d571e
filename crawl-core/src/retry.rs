use std::time;

/// The retry policy used to schedule a frontier entry's next attempt after a
/// retryable fetch failure. The computed interval is recorded on the entry as
/// a `not_before` timestamp; claims ignore entries whose gate is in the future.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Growth factor applied per prior attempt.
    backoff_coefficient: u32,
    /// Backoff before the very first retry.
    initial_interval: time::Duration,
    /// Ceiling on any computed backoff, Retry-After included.
    maximum_interval: Option<time::Duration>,
    /// Fetch attempts allowed per URL before it is marked failed.
    max_retries: u32,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
        max_retries: u32,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Calculate the backoff before the next attempt. `attempt` counts prior
    /// failures, so the first retry of an entry passes 0.
    ///
    /// An origin's Retry-After raises the exponential interval but never
    /// shortens it; the configured maximum caps the result either way.
    pub fn retry_interval(
        &self,
        attempt: u32,
        retry_after: Option<time::Duration>,
    ) -> time::Duration {
        let mut interval = self.initial_interval * self.backoff_coefficient.pow(attempt);
        if let Some(floor) = retry_after {
            interval = interval.max(floor);
        }
        if let Some(cap) = self.maximum_interval {
            interval = interval.min(cap);
        }
        interval
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(2),
            maximum_interval: None,
            max_retries: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.retry_interval(0, None), time::Duration::from_secs(2));
        assert_eq!(policy.retry_interval(1, None), time::Duration::from_secs(4));
        assert_eq!(policy.retry_interval(2, None), time::Duration::from_secs(8));
    }

    #[test]
    fn retry_after_is_a_floor() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.retry_interval(0, Some(time::Duration::from_secs(60))),
            time::Duration::from_secs(60)
        );
        // A small preference never shortens the computed backoff.
        assert_eq!(
            policy.retry_interval(2, Some(time::Duration::from_secs(1))),
            time::Duration::from_secs(8)
        );
    }

    #[test]
    fn maximum_interval_caps_everything() {
        let policy = RetryPolicy::new(
            2,
            time::Duration::from_secs(2),
            Some(time::Duration::from_secs(5)),
            3,
        );
        assert_eq!(policy.retry_interval(4, None), time::Duration::from_secs(5));
        assert_eq!(
            policy.retry_interval(0, Some(time::Duration::from_secs(90))),
            time::Duration::from_secs(5)
        );
    }
}
