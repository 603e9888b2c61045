//! Reconnect backoff policy

use std::time::Duration;

/// Capped exponential backoff: `delay = min(base * 2^attempt, max)`
///
/// Delays never decrease between resets. `reset` is called right after a
/// successful authentication.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    /// Create a policy; `max` is raised to `base` if smaller
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Delay for the current attempt, then advance
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Delay for a given attempt number without changing state
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Failed cycles since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Back to the base delay
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay cap
    pub fn max(&self) -> Duration {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sequence_doubles_until_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1_000));
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000, 1_000]);
        assert_eq!(backoff.attempt(), 7);
    }

    #[test]
    fn test_reset_returns_to_base() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_huge_attempt_counts_saturate_at_cap() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(backoff.delay_for(31), Duration::from_secs(30));
        assert_eq!(backoff.delay_for(32), Duration::from_secs(30));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_max_below_base_is_raised() {
        let backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.max(), Duration::from_secs(5));
        assert_eq!(backoff.delay_for(0), Duration::from_secs(5));
    }

    proptest! {
        #[test]
        fn test_delays_are_monotonic_and_capped(
            base_ms in 1u64..10_000,
            extra_ms in 0u64..600_000,
            steps in 1usize..64
        ) {
            let max = Duration::from_millis(base_ms + extra_ms);
            let mut backoff = Backoff::new(Duration::from_millis(base_ms), max);

            let mut previous = Duration::ZERO;
            for step in 0..steps {
                let delay = backoff.next_delay();
                prop_assert!(delay >= previous);
                prop_assert!(delay <= max);
                if step == 0 {
                    prop_assert_eq!(delay, Duration::from_millis(base_ms));
                }
                previous = delay;
            }

            backoff.reset();
            prop_assert_eq!(backoff.next_delay(), Duration::from_millis(base_ms));
        }
    }
}
