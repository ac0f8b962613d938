//! Exponential backoff with full jitter.

use std::time::Duration;

/// Retry tuning knobs for transient provider errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay before the first retry.
    pub initial_delay: Duration,
    /// Delay multiplier per attempt.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Total attempts per model, including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(8),
            max_attempts: 4,
        }
    }
}

impl RetryPolicy {
    /// Backoff ceiling for the given zero-based retry index:
    /// `initial × multiplier^attempt`, capped at `max_delay`.
    #[must_use]
    pub fn ceiling_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64;
        let scaled = base * self.multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// The actual delay to sleep before retry `attempt`: full jitter,
    /// uniform in `[0, ceiling]`. A rate-limit hint from the provider
    /// overrides the jittered value when it is longer.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let ceiling = self.ceiling_for(attempt);
        let jittered = Duration::from_millis(fastrand::u64(0..=ceiling.as_millis() as u64));
        match hint {
            Some(hint) if hint > jittered => hint.min(self.max_delay),
            _ => jittered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_doubles_until_the_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.ceiling_for(0), Duration::from_millis(200));
        assert_eq!(policy.ceiling_for(1), Duration::from_millis(400));
        assert_eq!(policy.ceiling_for(2), Duration::from_millis(800));
        assert_eq!(policy.ceiling_for(10), Duration::from_secs(8));
    }

    #[test]
    fn delay_stays_within_the_ceiling() {
        let policy = RetryPolicy::default();
        for attempt in 0..6 {
            for _ in 0..32 {
                assert!(policy.delay_for(attempt, None) <= policy.ceiling_for(attempt));
            }
        }
    }

    #[test]
    fn rate_limit_hint_wins_when_longer() {
        let policy = RetryPolicy::default();
        let hint = Duration::from_secs(5);
        // With a 200ms ceiling, any jittered value is below the hint.
        assert_eq!(policy.delay_for(0, Some(hint)), hint);
    }

    #[test]
    fn rate_limit_hint_is_capped_at_max_delay() {
        let policy = RetryPolicy::default();
        let hint = Duration::from_secs(120);
        assert_eq!(policy.delay_for(0, Some(hint)), policy.max_delay);
    }
}
