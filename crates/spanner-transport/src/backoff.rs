//! Exponential backoff with jitter.

use std::time::Duration;

/// Exponential backoff schedule.
///
/// The delay for attempt `n` (starting at 1) is
/// `min(initial * multiplier^(n-1), max)`, shortened by a random factor of
/// up to `jitter`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[non_exhaustive]
pub struct Backoff {
    /// Delay before the first retry (default: 50ms).
    pub initial: Duration,
    /// Upper bound of any delay (default: 10s).
    pub max: Duration,
    /// Growth factor per attempt (default: 1.3).
    pub multiplier: f64,
    /// Fraction of each delay that is randomized, in `[0, 1]` (default: 0.4).
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(10),
            multiplier: 1.3,
            jitter: 0.4,
        }
    }
}

impl Backoff {
    /// Create a backoff with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial delay.
    #[must_use]
    pub fn initial(mut self, initial: Duration) -> Self {
        self.initial = initial;
        self
    }

    /// Set the maximum delay.
    #[must_use]
    pub fn max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the jitter fraction; clamped to `[0, 1]`.
    #[must_use]
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// The delay before retry number `attempt`.
    ///
    /// Attempt 0 has no delay.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        let capped = base.min(self.max.as_secs_f64());
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 - jitter * rand::random::<f64>();
        Duration::from_secs_f64((capped * factor).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_for_attempt(0), Duration::ZERO);
        for attempt in 1..10 {
            let d = backoff.delay_for_attempt(attempt);
            assert!(d <= backoff.max);
        }
    }

    #[test]
    fn test_without_jitter_is_exact() {
        let backoff = Backoff::new()
            .initial(Duration::from_millis(100))
            .multiplier(2.0)
            .max(Duration::from_millis(500))
            .jitter(0.0);
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let backoff = Backoff::new().initial(Duration::from_secs(1)).jitter(0.4);
        for _ in 0..100 {
            let d = backoff.delay_for_attempt(1);
            assert!(d >= Duration::from_millis(599) && d <= Duration::from_secs(1));
        }
    }
}
