//! Rate limiting primitives.
//!
//! This module provides the building blocks for provider-side rate limiting:
//! - [`RateLimitStrategy`]: the per-route limiter contract.
//! - [`Resolution`]: the result of asking a limiter whether the head of the
//!   queue may dispatch.
//! - [`WindowState`]: header-driven window bookkeeping shared by the window
//!   and dual-window strategies.
//!
//! Three strategies implement the contract: a generic request window
//! ([`window::WindowStrategy`]), a config-driven token bucket
//! ([`token_bucket::TokenBucketStrategy`]), and an OpenAI-style dual window
//! tracking requests and tokens independently
//! ([`dual_window::DualWindowStrategy`]). The
//! [`coordinator::RateLimitCoordinator`] owns one strategy per route key and
//! overlays a fallback token bucket when the strategy doesn't handle token
//! limits itself.

use crate::headers::Headers;
use crate::usage::TokenUsage;
use std::time::Duration;

pub mod coordinator;
pub mod dual_window;
pub mod token_bucket;
pub mod window;

/// Extra wait past a window's reset before probing it, giving the provider's
/// counters time to actually roll over.
pub(crate) const PROBE_DELAY_MS: u64 = 500;
/// Budget slack treated as exhaustion: at or below this many effective slots,
/// stop dispatching and wait for the window to reset.
pub(crate) const EXHAUSTION_BUFFER: u64 = 0;
/// Floor for the pacing interval between dispatches on one route.
pub(crate) const MIN_PACE_INTERVAL_MS: u64 = 10;
/// Pacing-cursor updates closer than this to the current cursor are dropped
/// to avoid jitter from clock noise.
pub(crate) const NEXT_ALLOWED_UPDATE_THRESHOLD_MS: u64 = 5;

/// Decision for the head-of-queue request on one route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Dispatch now; any needed reservation has been taken.
    Proceed,
    /// Not now; retry at `wake_up_at` (controller-clock ms) when known.
    Wait { wake_up_at: Option<u64> },
    /// Not now and no timer will help; waiting on in-flight completions to
    /// refresh provider state.
    Blocked,
    /// The request was rejected synchronously during the check; drop it.
    Skip,
}

impl Resolution {
    pub fn is_proceed(&self) -> bool {
        matches!(self, Resolution::Proceed)
    }

    pub fn wake_up_at(&self) -> Option<u64> {
        match self {
            Resolution::Wait { wake_up_at } => *wake_up_at,
            _ => None,
        }
    }
}

/// Point-in-time view of one window dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: u64,
    pub reserved: u64,
    pub next_allowed_at: u64,
}

/// Snapshot returned by header ingestion, for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitUpdate {
    pub requests: Option<WindowSnapshot>,
    pub tokens: Option<WindowSnapshot>,
    pub retry_after: Option<Duration>,
}

/// Contract every per-route limiter implements.
pub trait RateLimitStrategy: Send + std::fmt::Debug {
    /// Decide whether the head may dispatch, reserving resources on
    /// [`Resolution::Proceed`].
    fn resolve(&mut self, estimated_tokens: Option<u64>) -> Resolution;

    /// The request was actually launched.
    fn on_dispatch(&mut self) {}

    /// The request settled. Releases any reservation; must never underflow.
    /// `unreconciled_tokens` carries the token reservation back when no usage
    /// was recorded for it (failures).
    fn on_complete(&mut self, unreconciled_tokens: Option<u64>);

    /// Reconcile estimated vs. actual token consumption.
    fn record_usage(&mut self, usage: &TokenUsage, reserved_tokens: Option<u64>) {
        let _ = (usage, reserved_tokens);
    }

    /// Ingest provider feedback; returns a snapshot when anything changed.
    fn update_from_headers(&mut self, headers: &Headers) -> Option<RateLimitUpdate>;

    /// Whether this strategy enforces token limits itself. When `false`, the
    /// coordinator overlays its fallback token bucket.
    fn handles_token_limits(&self) -> bool {
        false
    }
}

/// Header-driven window bookkeeping for one dimension (requests or tokens).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WindowState {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: u64,
    pub reserved: u64,
    pub next_allowed_at: u64,
}

impl WindowState {
    pub fn new(limit: u64, now: u64, window_ms: u64) -> Self {
        Self {
            limit,
            remaining: limit,
            reset_at: now + window_ms,
            reserved: 0,
            next_allowed_at: 0,
        }
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            limit: self.limit,
            remaining: self.remaining,
            reset_at: self.reset_at,
            reserved: self.reserved,
            next_allowed_at: self.next_allowed_at,
        }
    }

    pub fn effective_remaining(&self) -> u64 {
        self.remaining.saturating_sub(self.reserved)
    }

    /// Reserve one slot and advance the pacing cursor, spreading the
    /// remaining budget across the remaining window.
    pub fn reserve(&mut self, now: u64) {
        self.reserved += 1;

        let window_remaining = self.reset_at.saturating_sub(now);
        let per_slot = window_remaining.div_ceil(self.effective_remaining().max(1));
        let interval = per_slot.max(MIN_PACE_INTERVAL_MS);
        // Pacing never pushes past the reset itself.
        let candidate = (now + interval).min(self.reset_at.max(now));

        if candidate > self.next_allowed_at
            && candidate - self.next_allowed_at > NEXT_ALLOWED_UPDATE_THRESHOLD_MS
        {
            self.next_allowed_at = candidate;
        }
    }

    /// Release one reservation; saturates rather than underflowing.
    pub fn release(&mut self) {
        self.reserved = self.reserved.saturating_sub(1);
    }

    /// Count one completed call against the window when no header refresh
    /// arrived to do it for us.
    pub fn consume(&mut self) {
        self.release();
        self.remaining = self.remaining.saturating_sub(1);
    }

    /// Apply header-reported state. Within a live window, `remaining` only
    /// moves down and `reset_at` only moves up; an expired window takes the
    /// reported values verbatim.
    pub fn apply_headers(
        &mut self,
        now: u64,
        limit: Option<u64>,
        remaining: Option<u64>,
        reset_in: Option<Duration>,
    ) -> bool {
        let mut changed = false;
        let same_window = now < self.reset_at;

        if let Some(limit) = limit {
            if self.limit != limit {
                self.limit = limit;
                changed = true;
            }
        }

        if let Some(reported) = remaining {
            let reported = reported.min(self.limit);
            let next = if same_window { reported.min(self.remaining) } else { reported };
            if self.remaining != next {
                self.remaining = next;
                changed = true;
            }
        }

        if let Some(reset_in) = reset_in {
            let reported = now + reset_in.as_millis() as u64;
            let next = if same_window { reported.max(self.reset_at) } else { reported };
            if self.reset_at != next {
                self.reset_at = next;
                changed = true;
            }
        }

        changed
    }

    /// A bare `retry-after` extends both the reset and the pacing cursor.
    pub fn apply_retry_after(&mut self, now: u64, retry_after: Duration) {
        let until = now + retry_after.as_millis() as u64;
        self.reset_at = self.reset_at.max(until);
        self.next_allowed_at = self.next_allowed_at.max(until);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_paces_across_the_window() {
        let mut w = WindowState::new(60, 0, 60_000);
        w.reserve(0);
        // 60s window, 59 effective slots left: ~1017ms apart.
        assert!(w.next_allowed_at >= 1_000 && w.next_allowed_at <= 1_100);
        assert_eq!(w.reserved, 1);
    }

    #[test]
    fn pacing_floor_applies_to_roomy_windows() {
        let mut w = WindowState::new(1_000_000, 0, 1_000);
        w.reserve(0);
        assert_eq!(w.next_allowed_at, MIN_PACE_INTERVAL_MS);
    }

    #[test]
    fn pacing_cursor_never_passes_reset() {
        let mut w = WindowState::new(2, 0, 1_000);
        w.remaining = 1;
        w.reserve(900);
        assert!(w.next_allowed_at <= w.reset_at);
    }

    #[test]
    fn same_window_remaining_is_monotone_down() {
        let mut w = WindowState::new(60, 0, 60_000);
        w.apply_headers(10_000, Some(60), Some(10), None);
        assert_eq!(w.remaining, 10);

        // A later, higher report inside the same window must not raise it.
        let changed = w.apply_headers(20_000, Some(60), Some(30), None);
        assert!(!changed);
        assert_eq!(w.remaining, 10);
    }

    #[test]
    fn same_window_reset_is_monotone_up() {
        let mut w = WindowState::new(60, 0, 60_000);
        let original = w.reset_at;
        w.apply_headers(10_000, None, None, Some(Duration::from_secs(10)));
        assert_eq!(w.reset_at, original);

        w.apply_headers(10_000, None, None, Some(Duration::from_secs(120)));
        assert_eq!(w.reset_at, 130_000);
    }

    #[test]
    fn expired_window_takes_reported_values_verbatim() {
        let mut w = WindowState::new(60, 0, 1_000);
        w.remaining = 0;
        w.apply_headers(5_000, Some(60), Some(45), Some(Duration::from_secs(60)));
        assert_eq!(w.remaining, 45);
        assert_eq!(w.reset_at, 65_000);
    }

    #[test]
    fn remaining_is_clamped_to_limit() {
        let mut w = WindowState::new(10, 0, 1_000);
        w.remaining = 0;
        w.apply_headers(5_000, Some(10), Some(99), None);
        assert_eq!(w.remaining, 10);
    }

    #[test]
    fn release_never_underflows() {
        let mut w = WindowState::new(10, 0, 1_000);
        w.release();
        assert_eq!(w.reserved, 0);
    }

    #[test]
    fn retry_after_extends_reset_and_cursor() {
        let mut w = WindowState::new(10, 0, 1_000);
        w.apply_retry_after(500, Duration::from_secs(5));
        assert_eq!(w.reset_at, 5_500);
        assert_eq!(w.next_allowed_at, 5_500);
    }
}
