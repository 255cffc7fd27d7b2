//! Config-driven token-bucket strategy: one token per request, refilled at a
//! steady rate.

use super::{RateLimitStrategy, RateLimitUpdate, Resolution};
use crate::clock::Clock;
use crate::headers::{self, Headers};
use std::sync::Arc;

/// Token bucket paced off configuration rather than provider headers. A
/// provider 429 (`retry-after`) imposes a cooldown checked before any bucket
/// math.
#[derive(Debug)]
pub struct TokenBucketStrategy {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    updated_at: u64,
    cooldown_until: Option<u64>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketStrategy {
    pub fn new(capacity: f64, refill_per_second: f64, clock: Arc<dyn Clock>) -> Self {
        let updated_at = clock.now_millis();
        Self {
            capacity,
            refill_per_second,
            tokens: capacity.max(0.0),
            updated_at,
            cooldown_until: None,
            clock,
        }
    }

    /// Budgeted off requests-per-minute: burst size caps the bucket, or one
    /// second's worth of refill when unset.
    pub fn from_requests_per_minute(
        requests_per_minute: u64,
        burst_size: Option<u64>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let refill = requests_per_minute as f64 / 60.0;
        let capacity = burst_size.map(|b| b as f64).unwrap_or_else(|| refill.max(1.0));
        Self::new(capacity, refill, clock)
    }

    fn refill(&mut self, now: u64) {
        let elapsed_secs = now.saturating_sub(self.updated_at) as f64 / 1_000.0;
        self.tokens = (self.tokens + elapsed_secs * self.refill_per_second).min(self.capacity);
        self.updated_at = now;
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> f64 {
        self.tokens
    }
}

impl RateLimitStrategy for TokenBucketStrategy {
    fn resolve(&mut self, _estimated_tokens: Option<u64>) -> Resolution {
        let now = self.clock.now_millis();

        if let Some(until) = self.cooldown_until {
            if now < until {
                return Resolution::Wait { wake_up_at: Some(until) };
            }
            self.cooldown_until = None;
        }

        // Misconfigured buckets admit nothing until reconfigured.
        if self.capacity <= 0.0 || self.refill_per_second <= 0.0 {
            return Resolution::Wait { wake_up_at: None };
        }

        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Resolution::Proceed;
        }

        let wait_ms =
            ((1.0 - self.tokens) / self.refill_per_second * 1_000.0).ceil() as u64;
        Resolution::Wait { wake_up_at: Some(now + wait_ms) }
    }

    fn on_complete(&mut self, _unreconciled_tokens: Option<u64>) {
        // Consumption happened at resolve; nothing to release.
    }

    fn update_from_headers(&mut self, headers: &Headers) -> Option<RateLimitUpdate> {
        let retry_after = headers::retry_after_hint(headers)?;
        let until = self.clock.now_millis() + retry_after.as_millis() as u64;
        self.cooldown_until = Some(self.cooldown_until.map_or(until, |cur| cur.max(until)));
        Some(RateLimitUpdate { requests: None, tokens: None, retry_after: Some(retry_after) })
    }
}
