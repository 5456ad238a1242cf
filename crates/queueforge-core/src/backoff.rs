//! Retry backoff math: exponential doubling with a configurable base and
//! cap, plus bounded additive jitter so two attempts of the same job never
//! wake at exactly the same instant.

use chrono::Duration;

/// Parameters for the exponential-backoff-with-jitter schedule.
///
/// `delay(attempt) = min(cap, base * 2^attempt) + random(0, jitter)`, with
/// the total capped at `cap`. The exponential term is a floor: jitter is
/// added on top of it rather than sampled from it, so a retry is never
/// scheduled sooner than the deterministic backoff would put it.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::seconds(10),
            cap: Duration::minutes(10),
            jitter: Duration::seconds(5),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration, jitter: Duration) -> Self {
        Self { base, cap, jitter }
    }

    /// Delay before the next attempt, given the number of attempts already
    /// made (1 after the first failure, 2 after the second, ...).
    ///
    /// Deterministic given an injected `rand`, so callers can reproduce a
    /// specific delay in tests without depending on global randomness.
    pub fn delay_for_attempt(&self, attempt: u32, rand: f64) -> Duration {
        debug_assert!((0.0..=1.0).contains(&rand));
        let base_ms = self.base.num_milliseconds().max(1) as f64;
        let cap_ms = self.cap.num_milliseconds().max(1) as f64;
        let jitter_ms = self.jitter.num_milliseconds().max(0) as f64;
        let floor_ms = (base_ms * 2f64.powi(attempt as i32)).min(cap_ms);
        let delay_ms = (floor_ms + jitter_ms * rand).min(cap_ms);
        Duration::milliseconds(delay_ms as i64)
    }

    /// Convenience wrapper that draws jitter from the process RNG.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.delay_for_attempt(attempt, fastrand::f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_with_attempt_up_to_the_cap() {
        let policy = BackoffPolicy::new(Duration::seconds(1), Duration::seconds(60), Duration::zero());
        let d1 = policy.delay_for_attempt(1, 1.0);
        let d5 = policy.delay_for_attempt(5, 1.0);
        let d20 = policy.delay_for_attempt(20, 1.0);
        assert!(d1 < d5);
        assert_eq!(d20, Duration::seconds(60));
    }

    #[test]
    fn zero_jitter_draw_gives_the_floor_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(3, 0.0), Duration::seconds(80));
    }

    #[test]
    fn jitter_never_pushes_delay_below_the_floor() {
        let policy = BackoffPolicy::new(Duration::seconds(10), Duration::minutes(10), Duration::seconds(5));
        let floor = Duration::seconds(20);
        for rand in [0.0, 0.25, 0.5, 0.75, 1.0] {
            assert!(policy.delay_for_attempt(1, rand) >= floor);
        }
    }

    #[test]
    fn jitter_does_not_push_delay_past_the_cap() {
        let policy = BackoffPolicy::new(Duration::seconds(10), Duration::seconds(60), Duration::seconds(5));
        assert_eq!(policy.delay_for_attempt(20, 1.0), Duration::seconds(60));
    }
}
