//! Route-keyed strategy ownership and composition.
//!
//! The coordinator creates one strategy per route on first touch (through an
//! injected factory driven by configuration) and overlays a fallback token
//! bucket for strategies that don't enforce token limits themselves.

use super::dual_window::DualWindowStrategy;
use super::token_bucket::TokenBucketStrategy;
use super::window::WindowStrategy;
use super::{RateLimitStrategy, RateLimitUpdate, Resolution};
use crate::clock::Clock;
use crate::config::{RouteLimits, StrategyKind, StrategySelection};
use crate::headers::Headers;
use crate::usage::TokenUsage;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds the strategy for a route the first time it is touched.
pub(crate) type StrategyFactory =
    Box<dyn Fn(&str, Option<&RouteLimits>) -> Box<dyn RateLimitStrategy> + Send>;

/// Token pacing overlaid on strategies that only pace requests. Accounting is
/// post-hoc: admission only requires a positive balance, and recorded usage
/// may push the balance negative until refill catches up.
#[derive(Debug)]
struct FallbackBucket {
    tokens: f64,
    capacity: f64,
    refill_per_second: f64,
    updated_at: u64,
}

impl FallbackBucket {
    fn new(tokens_per_minute: u64, now: u64) -> Self {
        let capacity = tokens_per_minute as f64;
        Self { tokens: capacity, capacity, refill_per_second: capacity / 60.0, updated_at: now }
    }

    fn refill(&mut self, now: u64) {
        let elapsed_secs = now.saturating_sub(self.updated_at) as f64 / 1_000.0;
        self.tokens = (self.tokens + elapsed_secs * self.refill_per_second).min(self.capacity);
        self.updated_at = now;
    }

    /// Milliseconds until the balance is back to one admissible token.
    fn refill_eta_ms(&self, now: u64) -> u64 {
        if self.refill_per_second <= 0.0 {
            return 0;
        }
        now + (((1.0 - self.tokens) / self.refill_per_second) * 1_000.0).ceil() as u64
    }

    fn admit(&mut self, now: u64) -> Resolution {
        self.refill(now);
        if self.tokens >= 1.0 {
            Resolution::Proceed
        } else {
            Resolution::Wait { wake_up_at: Some(self.refill_eta_ms(now)) }
        }
    }

    /// Debit actual usage; returns a wakeup hint when the balance went
    /// negative.
    fn debit(&mut self, amount: u64, now: u64) -> Option<u64> {
        self.refill(now);
        self.tokens -= amount as f64;
        (self.tokens < 0.0).then(|| self.refill_eta_ms(now))
    }
}

/// Owns per-route strategies and aggregates their decisions.
pub(crate) struct RateLimitCoordinator {
    strategies: HashMap<String, Box<dyn RateLimitStrategy>>,
    fallback_buckets: HashMap<String, FallbackBucket>,
    limits: HashMap<String, RouteLimits>,
    factory: StrategyFactory,
    clock: Arc<dyn Clock>,
}

impl RateLimitCoordinator {
    pub fn new(
        limits: HashMap<String, RouteLimits>,
        selection: StrategySelection,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let factory_clock = clock.clone();
        let factory: StrategyFactory = Box::new(move |route, config| {
            build_strategy(route, config, &selection, factory_clock.clone())
        });
        Self {
            strategies: HashMap::new(),
            fallback_buckets: HashMap::new(),
            limits,
            factory,
            clock,
        }
    }

    /// Replace the strategy factory.
    #[allow(dead_code)]
    pub fn with_factory(mut self, factory: StrategyFactory) -> Self {
        self.factory = factory;
        self
    }

    fn ensure_strategy(&mut self, route: &str) -> &mut Box<dyn RateLimitStrategy> {
        if !self.strategies.contains_key(route) {
            let strategy = (self.factory)(route, self.limits.get(route));
            tracing::debug!(route, ?strategy, "created rate-limit strategy");
            self.strategies.insert(route.to_string(), strategy);
        }
        self.strategies.get_mut(route).expect("strategy just ensured")
    }

    fn tokens_per_minute(&self, route: &str) -> Option<u64> {
        self.limits
            .get(route)
            .map(|l| l.tokens_per_minute)
            .filter(|&tpm| tpm > 0)
    }

    /// Resolve the head-of-queue request for `route`.
    pub fn resolve(&mut self, route: &str, estimated_tokens: Option<u64>) -> Resolution {
        let now = self.clock.now_millis();
        let needs_fallback = {
            let strategy = self.ensure_strategy(route);
            !strategy.handles_token_limits()
        };

        if needs_fallback {
            if let Some(tpm) = self.tokens_per_minute(route) {
                let bucket = self
                    .fallback_buckets
                    .entry(route.to_string())
                    .or_insert_with(|| FallbackBucket::new(tpm, now));
                // Checked before the strategy so a token wait never strands a
                // request-window reservation.
                if let wait @ Resolution::Wait { .. } = bucket.admit(now) {
                    return wait;
                }
            }
        }

        self.ensure_strategy(route).resolve(estimated_tokens)
    }

    /// Token reservation a strategy stashed for a dispatch, to be passed back
    /// on completion or usage recording. Mirrors the charge taken in
    /// `resolve` by token-capable strategies.
    pub fn reservation_for(&self, route: &str, estimated_tokens: Option<u64>) -> Option<u64> {
        self.strategies
            .get(route)
            .filter(|s| s.handles_token_limits())
            .map(|_| estimated_tokens.unwrap_or(1))
    }

    pub fn on_dispatch(&mut self, route: &str) {
        if let Some(strategy) = self.strategies.get_mut(route) {
            strategy.on_dispatch();
        }
    }

    pub fn on_complete(&mut self, route: &str, unreconciled_tokens: Option<u64>) {
        if let Some(strategy) = self.strategies.get_mut(route) {
            strategy.on_complete(unreconciled_tokens);
        }
    }

    /// Feed actual usage back; returns a wakeup hint when the fallback
    /// bucket went negative.
    pub fn record_usage(
        &mut self,
        route: &str,
        usage: &TokenUsage,
        reserved_tokens: Option<u64>,
    ) -> Option<u64> {
        let handles_tokens = self
            .strategies
            .get(route)
            .map(|s| s.handles_token_limits())
            .unwrap_or(false);

        if handles_tokens {
            if let Some(strategy) = self.strategies.get_mut(route) {
                strategy.record_usage(usage, reserved_tokens);
            }
            return None;
        }

        let now = self.clock.now_millis();
        self.fallback_buckets
            .get_mut(route)
            .and_then(|bucket| bucket.debit(usage.total(), now))
    }

    /// Ingest provider headers for a route, creating its strategy if needed
    /// so pre-seeded routes are gated before their first submission.
    pub fn update_from_headers(
        &mut self,
        route: &str,
        headers: &Headers,
    ) -> Option<RateLimitUpdate> {
        self.ensure_strategy(route).update_from_headers(headers)
    }
}

impl std::fmt::Debug for RateLimitCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitCoordinator")
            .field("strategies", &self.strategies)
            .field("fallback_buckets", &self.fallback_buckets)
            .finish()
    }
}

/// Default strategy wiring:
/// - explicit selection for the route, then its provider, wins;
/// - a configured token budget gets the dual window;
/// - a configured request budget alone gets the config-paced token bucket;
/// - unconfigured routes get a header-driven dual window.
fn build_strategy(
    route: &str,
    config: Option<&RouteLimits>,
    selection: &StrategySelection,
    clock: Arc<dyn Clock>,
) -> Box<dyn RateLimitStrategy> {
    let provider = route.split("::").next().unwrap_or(route);
    let kind = selection
        .routes
        .get(route)
        .or_else(|| selection.providers.get(provider))
        .copied()
        .unwrap_or_else(|| match config {
            Some(limits) if limits.tokens_per_minute > 0 => StrategyKind::DualWindow,
            Some(_) => StrategyKind::TokenBucket,
            None => StrategyKind::DualWindow,
        });

    let rpm = config.map(|l| l.requests_per_minute).unwrap_or(0);
    let tpm = config.map(|l| l.tokens_per_minute).unwrap_or(0);
    let burst = config.and_then(|l| l.burst_size);

    match kind {
        StrategyKind::Window => Box::new(WindowStrategy::new(rpm, clock)),
        StrategyKind::TokenBucket => {
            Box::new(TokenBucketStrategy::from_requests_per_minute(rpm, burst, clock))
        }
        StrategyKind::DualWindow => Box::new(DualWindowStrategy::new(rpm, tpm, clock)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::headers::{LIMIT_REQUESTS, REMAINING_REQUESTS, RESET_REQUESTS};

    fn coordinator(clock: &ManualClock) -> RateLimitCoordinator {
        RateLimitCoordinator::new(
            HashMap::new(),
            StrategySelection::default(),
            Arc::new(clock.clone()),
        )
    }

    fn coordinator_with(
        clock: &ManualClock,
        route: &str,
        limits: RouteLimits,
        selection: StrategySelection,
    ) -> RateLimitCoordinator {
        let mut map = HashMap::new();
        map.insert(route.to_string(), limits);
        RateLimitCoordinator::new(map, selection, Arc::new(clock.clone()))
    }

    #[test]
    fn unconfigured_routes_flow_freely() {
        let clock = ManualClock::new();
        let mut c = coordinator(&clock);
        for _ in 0..10 {
            assert_eq!(c.resolve("p::m", None), Resolution::Proceed);
        }
    }

    #[test]
    fn header_seeding_gates_before_first_submission() {
        let clock = ManualClock::new();
        let mut c = coordinator(&clock);

        c.update_from_headers(
            "p0::m0",
            &Headers::from_pairs([
                (LIMIT_REQUESTS, "1"),
                (REMAINING_REQUESTS, "0"),
                (RESET_REQUESTS, "1s"),
            ]),
        );

        assert!(matches!(c.resolve("p0::m0", None), Resolution::Wait { .. }));
        // Unrelated routes are unaffected.
        assert_eq!(c.resolve("p1::m1", None), Resolution::Proceed);
    }

    #[test]
    fn config_without_tokens_uses_a_token_bucket() {
        let clock = ManualClock::new();
        let mut c = coordinator_with(
            &clock,
            "p::m",
            RouteLimits { requests_per_minute: 60, tokens_per_minute: 0, burst_size: Some(2) },
            StrategySelection::default(),
        );

        assert_eq!(c.resolve("p::m", None), Resolution::Proceed);
        assert_eq!(c.resolve("p::m", None), Resolution::Proceed);
        assert!(matches!(c.resolve("p::m", None), Resolution::Wait { .. }));
    }

    #[test]
    fn explicit_selection_overrides_config_shape() {
        let clock = ManualClock::new();
        let mut selection = StrategySelection::default();
        selection.routes.insert("p::m".into(), StrategyKind::Window);
        let mut c = coordinator_with(
            &clock,
            "p::m",
            RouteLimits { requests_per_minute: 1, tokens_per_minute: 0, burst_size: None },
            selection,
        );

        // Window semantics: first through, then exhaustion wait (a bucket
        // with rpm=1 would instead wait on refill at ~60s).
        assert_eq!(c.resolve("p::m", None), Resolution::Proceed);
        match c.resolve("p::m", None) {
            Resolution::Wait { wake_up_at: Some(at) } => assert!(at >= 60_000),
            other => panic!("expected wait, got {:?}", other),
        }
    }

    #[test]
    fn fallback_bucket_paces_tokens_for_window_strategies() {
        let clock = ManualClock::new();
        let mut selection = StrategySelection::default();
        selection.routes.insert("p::m".into(), StrategyKind::Window);
        let mut c = coordinator_with(
            &clock,
            "p::m",
            RouteLimits { requests_per_minute: 0, tokens_per_minute: 60, burst_size: None },
            selection,
        );

        assert_eq!(c.resolve("p::m", Some(10)), Resolution::Proceed);
        // Burn the whole minute's budget.
        let wake = c.record_usage("p::m", &TokenUsage::totals(100, 20), None);
        assert!(wake.is_some());

        match c.resolve("p::m", Some(10)) {
            Resolution::Wait { wake_up_at: Some(at) } => assert!(at > 0),
            other => panic!("expected token-pacing wait, got {:?}", other),
        }
    }

    #[test]
    fn dual_window_strategies_manage_their_own_tokens() {
        let clock = ManualClock::new();
        let mut c = coordinator_with(
            &clock,
            "p::m",
            RouteLimits { requests_per_minute: 0, tokens_per_minute: 100, burst_size: None },
            StrategySelection::default(),
        );

        assert_eq!(c.resolve("p::m", Some(30)), Resolution::Proceed);
        // No fallback bucket was created for a token-capable strategy.
        assert!(c.fallback_buckets.is_empty());
        assert!(c.record_usage("p::m", &TokenUsage::totals(25, 5), Some(30)).is_none());
    }
}
