//! Generic request-window strategy.
//!
//! Tracks a single header-driven request window. Until the provider reports
//! anything (and no request budget is configured) the route is unthrottled.

use super::{
    RateLimitStrategy, RateLimitUpdate, Resolution, WindowState, EXHAUSTION_BUFFER,
    PROBE_DELAY_MS,
};
use crate::clock::Clock;
use crate::headers::{
    self, Headers, LIMIT_REQUESTS, REMAINING_REQUESTS, RESET_REQUESTS,
};
use std::sync::Arc;

const DEFAULT_WINDOW_MS: u64 = 60_000;

/// Request-window limiter for one route.
#[derive(Debug)]
pub struct WindowStrategy {
    window: Option<WindowState>,
    clock: Arc<dyn Clock>,
}

impl WindowStrategy {
    /// `requests_per_minute == 0` leaves the route unthrottled until headers
    /// arrive.
    pub fn new(requests_per_minute: u64, clock: Arc<dyn Clock>) -> Self {
        let window = (requests_per_minute > 0)
            .then(|| WindowState::new(requests_per_minute, clock.now_millis(), DEFAULT_WINDOW_MS));
        Self { window, clock }
    }

    #[cfg(test)]
    pub(crate) fn window(&self) -> Option<&WindowState> {
        self.window.as_ref()
    }
}

/// Shared request-window admission: exhaustion check, probe handling, pacing,
/// then reservation. Returns `None` when the caller may proceed.
pub(crate) fn resolve_request_window(window: &mut WindowState, now: u64) -> Option<Resolution> {
    if window.effective_remaining() <= EXHAUSTION_BUFFER {
        let probe_at = window.reset_at + PROBE_DELAY_MS;
        if now < probe_at {
            return Some(Resolution::Wait { wake_up_at: Some(probe_at) });
        }
        if window.reserved > 0 {
            // In-flight calls will bring fresh headers; no timer helps here.
            return Some(Resolution::Blocked);
        }
        // Single probe through to rediscover the window.
    }

    if now < window.next_allowed_at {
        return Some(Resolution::Wait { wake_up_at: Some(window.next_allowed_at) });
    }

    window.reserve(now);
    None
}

impl RateLimitStrategy for WindowStrategy {
    fn resolve(&mut self, _estimated_tokens: Option<u64>) -> Resolution {
        let Some(window) = self.window.as_mut() else {
            return Resolution::Proceed;
        };
        match resolve_request_window(window, self.clock.now_millis()) {
            Some(resolution) => resolution,
            None => Resolution::Proceed,
        }
    }

    fn on_complete(&mut self, _unreconciled_tokens: Option<u64>) {
        if let Some(window) = self.window.as_mut() {
            window.consume();
        }
    }

    fn update_from_headers(&mut self, headers: &Headers) -> Option<RateLimitUpdate> {
        let now = self.clock.now_millis();
        let limit = headers.get_u64(LIMIT_REQUESTS);
        let remaining = headers.get_u64(REMAINING_REQUESTS);
        let reset_in = headers.get(RESET_REQUESTS).and_then(headers::parse_reset);
        let retry_after = headers::retry_after_hint(headers);

        if limit.is_none() && remaining.is_none() && reset_in.is_none() && retry_after.is_none()
        {
            return None;
        }

        // A window created from headers starts expired so the first report is
        // taken verbatim instead of being clamped by monotonicity.
        let window = self
            .window
            .get_or_insert_with(|| WindowState::new(limit.unwrap_or(0), now, 0));
        window.apply_headers(now, limit, remaining, reset_in);
        if let Some(retry_after) = retry_after {
            window.apply_retry_after(now, retry_after);
        }

        Some(RateLimitUpdate {
            requests: Some(window.snapshot()),
            tokens: None,
            retry_after,
        })
    }
}
