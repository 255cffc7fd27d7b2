//! Backoff and jitter for the retry planner.

use rand::Rng;
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Fixed delay between attempts.
    Constant { delay: Duration },
    /// `base * 2^(attempt - 1)`, optionally capped.
    Exponential { base: Duration, max: Option<Duration> },
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, max: None }
    }

    /// Cap exponential growth at `max`.
    pub fn with_max(mut self, cap: Duration) -> Self {
        if let Backoff::Exponential { ref mut max, .. } = self {
            *max = Some(cap);
        }
        self
    }

    /// Delay for a 1-indexed attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Exponential { base, max } => {
                let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
                let raw = base
                    .checked_mul(multiplier)
                    .unwrap_or(Duration::from_secs(u64::MAX));
                match max {
                    Some(cap) => raw.min(*cap),
                    None => raw,
                }
            }
        }
    }
}

/// Jitter applied on top of a computed backoff delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Use the exact backoff delay.
    None,
    /// Random delay in `[0, delay]`.
    Full,
    /// `delay + random * delay * factor`; spreads retries without ever
    /// shortening the computed wait.
    Proportional { factor: f64 },
}

impl Jitter {
    pub fn full() -> Self {
        Jitter::Full
    }

    pub fn proportional(factor: f64) -> Self {
        Jitter::Proportional { factor }
    }

    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply with a caller-supplied RNG (deterministic in tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = delay.as_millis() as u64;
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
            Jitter::Proportional { factor } => {
                if millis == 0 || *factor <= 0.0 {
                    return delay;
                }
                let spread = (millis as f64 * factor * rng.random_range(0.0..=1.0)) as u64;
                Duration::from_millis(millis.saturating_add(spread))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn constant_backoff_is_flat() {
        let backoff = Backoff::constant(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(7), Duration::from_millis(100));
    }

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let backoff = Backoff::exponential(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_backoff_respects_cap() {
        let backoff =
            Backoff::exponential(Duration::from_millis(100)).with_max(Duration::from_secs(1));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(20), Duration::from_secs(1));
    }

    #[test]
    fn exponential_backoff_saturates_instead_of_overflowing() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        assert!(backoff.delay(64) > Duration::from_secs(1_000_000));
    }

    #[test]
    fn none_jitter_is_identity() {
        assert_eq!(Jitter::None.apply(Duration::from_secs(1)), Duration::from_secs(1));
    }

    #[test]
    fn full_jitter_stays_within_delay() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let jittered =
                Jitter::full().apply_with_rng(Duration::from_secs(1), &mut rng);
            assert!(jittered <= Duration::from_secs(1));
        }
    }

    #[test]
    fn proportional_jitter_never_shortens() {
        let mut rng = StdRng::seed_from_u64(7);
        let base = Duration::from_millis(1_000);
        for _ in 0..100 {
            let jittered =
                Jitter::proportional(0.25).apply_with_rng(base, &mut rng);
            assert!(jittered >= base);
            assert!(jittered <= Duration::from_millis(1_250));
        }
    }

    #[test]
    fn jitter_handles_zero_delay() {
        assert_eq!(Jitter::full().apply(Duration::ZERO), Duration::ZERO);
        assert_eq!(Jitter::proportional(0.5).apply(Duration::ZERO), Duration::ZERO);
    }
}
