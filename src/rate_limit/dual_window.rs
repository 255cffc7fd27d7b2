//! Dual-window strategy: independent request (RPM) and token (TPM) windows,
//! the shape OpenAI-compatible providers report through
//! `x-ratelimit-*-requests` and `x-ratelimit-*-tokens` headers.

use super::window::resolve_request_window;
use super::{RateLimitStrategy, RateLimitUpdate, Resolution, WindowState, PROBE_DELAY_MS};
use crate::clock::Clock;
use crate::headers::{
    self, Headers, LIMIT_REQUESTS, LIMIT_TOKENS, REMAINING_REQUESTS, REMAINING_TOKENS,
    RESET_REQUESTS, RESET_TOKENS,
};
use crate::usage::TokenUsage;
use std::sync::Arc;

const DEFAULT_WINDOW_MS: u64 = 60_000;
/// Charged against the token window when the caller gave no estimate.
const DEFAULT_TOKEN_ESTIMATE: u64 = 1;

/// Request + token window limiter for one route.
#[derive(Debug)]
pub struct DualWindowStrategy {
    requests: Option<WindowState>,
    tokens: Option<WindowState>,
    /// True once the provider has reported request-window headers; ends the
    /// bootstrap regime.
    request_headers_seen: bool,
    /// The single discovery probe admitted while only the token window is
    /// configured and no headers have arrived.
    bootstrap_in_flight: bool,
    clock: Arc<dyn Clock>,
}

impl DualWindowStrategy {
    pub fn new(
        requests_per_minute: u64,
        tokens_per_minute: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now_millis();
        Self {
            requests: (requests_per_minute > 0)
                .then(|| WindowState::new(requests_per_minute, now, DEFAULT_WINDOW_MS)),
            tokens: (tokens_per_minute > 0)
                .then(|| WindowState::new(tokens_per_minute, now, DEFAULT_WINDOW_MS)),
            request_headers_seen: false,
            bootstrap_in_flight: false,
            clock,
        }
    }

    /// Bootstrap regime: token budget configured but the request window is
    /// still unknown, so admit one in-flight call at a time to discover it.
    fn bootstrapping(&self) -> bool {
        self.requests.is_none() && self.tokens.is_some() && !self.request_headers_seen
    }

    #[cfg(test)]
    pub(crate) fn token_window(&self) -> Option<&WindowState> {
        self.tokens.as_ref()
    }
}

impl RateLimitStrategy for DualWindowStrategy {
    fn resolve(&mut self, estimated_tokens: Option<u64>) -> Resolution {
        let now = self.clock.now_millis();

        if self.bootstrapping() && self.bootstrap_in_flight {
            // The probe will bring headers; nothing to time out on.
            return Resolution::Blocked;
        }
        if let Some(requests) = self.requests.as_mut() {
            if let Some(resolution) = resolve_request_window(requests, now) {
                return resolution;
            }
        }

        let undo_request_reservation = |requests: &mut Option<WindowState>| {
            if let Some(w) = requests.as_mut() {
                w.release();
            }
        };

        if let Some(tokens) = self.tokens.as_mut() {
            let need = estimated_tokens.unwrap_or(DEFAULT_TOKEN_ESTIMATE);
            // Past the reset (plus probe slack) the stale budget no longer
            // binds; until then an exhausted window waits it out.
            let expired = now >= tokens.reset_at + PROBE_DELAY_MS;
            if !expired && tokens.remaining < need {
                undo_request_reservation(&mut self.requests);
                return Resolution::Wait {
                    wake_up_at: Some(tokens.reset_at + PROBE_DELAY_MS),
                };
            }
            if expired {
                tokens.remaining = tokens.limit;
                tokens.reset_at = now + DEFAULT_WINDOW_MS;
            }
            tokens.remaining = tokens.remaining.saturating_sub(need);
            tokens.reserved += need;
        }

        if self.bootstrapping() {
            self.bootstrap_in_flight = true;
        }
        Resolution::Proceed
    }

    fn on_complete(&mut self, unreconciled_tokens: Option<u64>) {
        self.bootstrap_in_flight = false;
        if let Some(requests) = self.requests.as_mut() {
            requests.consume();
        }
        if let Some(tokens) = self.tokens.as_mut() {
            // A failed call never consumed its estimate; credit it back.
            if let Some(reserved) = unreconciled_tokens {
                tokens.reserved = tokens.reserved.saturating_sub(reserved);
                tokens.remaining = (tokens.remaining + reserved).min(tokens.limit);
            }
        }
    }

    fn record_usage(&mut self, usage: &TokenUsage, reserved_tokens: Option<u64>) {
        let Some(tokens) = self.tokens.as_mut() else {
            return;
        };
        let reserved = reserved_tokens.unwrap_or(0);
        let actual = usage.total();
        tokens.reserved = tokens.reserved.saturating_sub(reserved);
        if actual > reserved {
            tokens.remaining = tokens.remaining.saturating_sub(actual - reserved);
        } else {
            tokens.remaining = (tokens.remaining + (reserved - actual)).min(tokens.limit);
        }
    }

    fn update_from_headers(&mut self, headers: &Headers) -> Option<RateLimitUpdate> {
        let now = self.clock.now_millis();

        let request_limit = headers.get_u64(LIMIT_REQUESTS);
        let request_remaining = headers.get_u64(REMAINING_REQUESTS);
        let request_reset = headers.get(RESET_REQUESTS).and_then(headers::parse_reset);
        let token_limit = headers.get_u64(LIMIT_TOKENS);
        let token_remaining = headers.get_u64(REMAINING_TOKENS);
        let token_reset = headers.get(RESET_TOKENS).and_then(headers::parse_reset);
        let retry_after = headers::retry_after_hint(headers);

        let request_dim =
            request_limit.is_some() || request_remaining.is_some() || request_reset.is_some();
        let token_dim =
            token_limit.is_some() || token_remaining.is_some() || token_reset.is_some();
        if !request_dim && !token_dim && retry_after.is_none() {
            return None;
        }

        if request_dim {
            self.request_headers_seen = true;
            let window = self
                .requests
                .get_or_insert_with(|| WindowState::new(request_limit.unwrap_or(0), now, 0));
            window.apply_headers(now, request_limit, request_remaining, request_reset);
        }
        if token_dim {
            let window = self
                .tokens
                .get_or_insert_with(|| WindowState::new(token_limit.unwrap_or(0), now, 0));
            window.apply_headers(now, token_limit, token_remaining, token_reset);
        }
        if let Some(retry_after) = retry_after {
            if let Some(window) = self.requests.as_mut() {
                window.apply_retry_after(now, retry_after);
            }
        }

        Some(RateLimitUpdate {
            requests: self.requests.as_ref().map(WindowState::snapshot),
            tokens: self.tokens.as_ref().map(WindowState::snapshot),
            retry_after,
        })
    }

    fn handles_token_limits(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn strategy(rpm: u64, tpm: u64, clock: &ManualClock) -> DualWindowStrategy {
        DualWindowStrategy::new(rpm, tpm, Arc::new(clock.clone()))
    }

    #[test]
    fn unconfigured_route_is_unthrottled() {
        let clock = ManualClock::new();
        let mut s = strategy(0, 0, &clock);
        for _ in 0..10 {
            assert_eq!(s.resolve(Some(1_000)), Resolution::Proceed);
        }
    }

    #[test]
    fn token_budget_gates_admission() {
        let clock = ManualClock::new();
        let mut s = strategy(0, 2, &clock);

        assert_eq!(s.resolve(Some(2)), Resolution::Proceed);
        s.record_usage(&TokenUsage { total_tokens: Some(2), ..Default::default() }, Some(2));
        s.on_complete(None);

        match s.resolve(Some(1)) {
            Resolution::Wait { wake_up_at: Some(at) } => {
                assert_eq!(at, 60_000 + PROBE_DELAY_MS);
            }
            other => panic!("expected token wait, got {:?}", other),
        }
    }

    #[test]
    fn bootstrap_admits_one_in_flight_probe() {
        let clock = ManualClock::new();
        let mut s = strategy(0, 100, &clock);

        assert_eq!(s.resolve(Some(1)), Resolution::Proceed);
        // Second call while the probe is out: blocked, not timed.
        assert_eq!(s.resolve(Some(1)), Resolution::Blocked);

        s.on_complete(Some(1));
        assert_eq!(s.resolve(Some(1)), Resolution::Proceed);
    }

    #[test]
    fn request_headers_end_the_bootstrap_regime() {
        let clock = ManualClock::new();
        let mut s = strategy(0, 100, &clock);

        s.update_from_headers(&Headers::from_pairs([
            (LIMIT_REQUESTS, "60"),
            (REMAINING_REQUESTS, "59"),
            (RESET_REQUESTS, "30s"),
        ]));

        assert_eq!(s.resolve(Some(1)), Resolution::Proceed);
        // No bootstrap serialization: a second call paces off the window
        // instead of blocking on the first.
        assert!(matches!(
            s.resolve(Some(1)),
            Resolution::Proceed | Resolution::Wait { .. }
        ));
    }

    #[test]
    fn failure_credits_the_estimate_back() {
        let clock = ManualClock::new();
        let mut s = strategy(0, 10, &clock);

        assert_eq!(s.resolve(Some(8)), Resolution::Proceed);
        assert_eq!(s.token_window().unwrap().remaining, 2);

        s.on_complete(Some(8));
        assert_eq!(s.token_window().unwrap().remaining, 10);
        assert_eq!(s.token_window().unwrap().reserved, 0);
    }

    #[test]
    fn usage_reconciliation_debits_overruns() {
        let clock = ManualClock::new();
        let mut s = strategy(0, 10, &clock);

        assert_eq!(s.resolve(Some(2)), Resolution::Proceed);
        s.record_usage(&TokenUsage { total_tokens: Some(6), ..Default::default() }, Some(2));
        s.on_complete(None);

        // 10 - 2 estimated - 4 overrun = 4.
        assert_eq!(s.token_window().unwrap().remaining, 4);
    }

    #[test]
    fn usage_reconciliation_credits_underruns() {
        let clock = ManualClock::new();
        let mut s = strategy(0, 10, &clock);

        assert_eq!(s.resolve(Some(6)), Resolution::Proceed);
        s.record_usage(&TokenUsage { total_tokens: Some(1), ..Default::default() }, Some(6));
        s.on_complete(None);

        assert_eq!(s.token_window().unwrap().remaining, 9);
    }

    #[test]
    fn token_window_refreshes_after_reset() {
        let clock = ManualClock::new();
        let mut s = strategy(0, 2, &clock);

        assert_eq!(s.resolve(Some(2)), Resolution::Proceed);
        s.record_usage(&TokenUsage { total_tokens: Some(2), ..Default::default() }, Some(2));
        s.on_complete(None);

        clock.set(60_000 + PROBE_DELAY_MS);
        assert_eq!(s.resolve(Some(1)), Resolution::Proceed);
    }

    #[test]
    fn token_headers_drive_the_token_window() {
        let clock = ManualClock::new();
        let mut s = strategy(0, 0, &clock);

        let update = s
            .update_from_headers(&Headers::from_pairs([
                (LIMIT_TOKENS, "1000"),
                (REMAINING_TOKENS, "5"),
                (RESET_TOKENS, "1m30.951s"),
            ]))
            .unwrap();
        let tokens = update.tokens.unwrap();
        assert_eq!(tokens.limit, 1_000);
        assert_eq!(tokens.remaining, 5);
        assert_eq!(tokens.reset_at, 90_951);

        // 5 remaining can't cover an estimate of 50.
        assert!(matches!(s.resolve(Some(50)), Resolution::Wait { .. }));
    }

    #[test]
    fn rpm_and_tpm_both_enforced() {
        let clock = ManualClock::new();
        let mut s = strategy(10, 100, &clock);

        assert_eq!(s.resolve(Some(10)), Resolution::Proceed);
        // Request pacing gates the second call even with token budget left.
        assert!(matches!(s.resolve(Some(10)), Resolution::Wait { .. }));
    }
}
