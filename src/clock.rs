//! Clock abstractions used by the window, circuit, and adaptive state machines.
//!
//! All absolute instants in the controller (window resets, circuit cooldowns,
//! queue deadlines, pacing cursors) are expressed as milliseconds on one of
//! these clocks so timing can be faked in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Monotonic clock backed by `tokio::time::Instant`.
///
/// Backing the clock with tokio's instant means a paused test runtime
/// (`tokio::test(start_paused = true)`) advances this clock together with
/// every sleep the controller schedules.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: tokio::time::Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: tokio::time::Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Hand-cranked clock for deterministic unit tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_on_demand() {
        let clock = ManualClock::new();
        assert_eq!(clock.now_millis(), 0);
        clock.advance(250);
        assert_eq!(clock.now_millis(), 250);
        clock.set(1_000);
        assert_eq!(clock.now_millis(), 1_000);
    }

    #[tokio::test]
    async fn monotonic_clock_moves_forward() {
        let clock = MonotonicClock::default();
        let a = clock.now_millis();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let b = clock.now_millis();
        assert!(b >= a);
    }
}
