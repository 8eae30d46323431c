use std::time::Duration;
use tokio::time::Instant;

/// Exponential delay between passes that keep hitting transient failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
    not_before: Option<Instant>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
            not_before: None,
        }
    }

    /// Delay that the current failure streak imposes: base * 2^(n-1), capped.
    pub fn delay(&self) -> Duration {
        if self.failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(self.failures - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn record_failure(&mut self, now: Instant) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.delay();
        self.not_before = Some(now + delay);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.not_before = None;
    }

    /// Time left before the next pass may run, if any.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.not_before
            .map(|deadline| deadline.saturating_duration_since(now))
            .filter(|left| !left.is_zero())
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(10));
        let now = Instant::now();
        assert_eq!(backoff.delay(), Duration::ZERO);
        assert_eq!(backoff.record_failure(now), Duration::from_secs(2));
        assert_eq!(backoff.record_failure(now), Duration::from_secs(4));
        assert_eq!(backoff.record_failure(now), Duration::from_secs(8));
        assert_eq!(backoff.record_failure(now), Duration::from_secs(10));
        for _ in 0..40 {
            backoff.record_failure(now);
        }
        assert_eq!(backoff.delay(), Duration::from_secs(10));
    }

    #[test]
    fn remaining_counts_down_and_reset_clears() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(60));
        let now = Instant::now();
        backoff.record_failure(now);
        assert_eq!(backoff.remaining(now), Some(Duration::from_secs(5)));
        assert_eq!(backoff.remaining(now + Duration::from_secs(3)), Some(Duration::from_secs(2)));
        assert_eq!(backoff.remaining(now + Duration::from_secs(5)), None);

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.remaining(now), None);
    }

    #[test]
    fn zero_base_never_defers() {
        let mut backoff = Backoff::new(Duration::ZERO, Duration::from_secs(60));
        let now = Instant::now();
        backoff.record_failure(now);
        assert_eq!(backoff.remaining(now), None);
    }
}
