//! Retry delay policy.
//!
//! The delay schedule is a pure function of the attempt count so it can be
//! tested independently of the state machine that consumes it. Jitter is
//! applied at the call site boundary only.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Failed attempts tolerated before giving up
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// True once `failures` exceeds the tolerated attempt count.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures > self.max_retries
    }

    /// Exponential delay for the given 0-based attempt: `base * 2^attempt`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// `delay_for` with up to ±10% jitter so synchronized failures don't
    /// retry in lockstep.
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        let factor: f64 = rand::thread_rng().gen_range(0.9..=1.1);
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = policy();
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
    }

    #[test]
    fn delay_is_capped() {
        let policy = policy();
        assert_eq!(policy.delay_for(7), Duration::from_secs(60));
        // Huge attempt counts must not overflow.
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn exhaustion_tracks_max_retries() {
        let policy = policy();
        assert!(!policy.is_exhausted(0));
        assert!(!policy.is_exhausted(5));
        assert!(policy.is_exhausted(6));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let policy = policy();
        for attempt in 0..8 {
            let exact = policy.delay_for(attempt).as_secs_f64();
            let jittered = policy.jittered_delay_for(attempt).as_secs_f64();
            assert!(jittered >= exact * 0.9 - f64::EPSILON);
            assert!(jittered <= exact * 1.1 + f64::EPSILON);
        }
    }
}
