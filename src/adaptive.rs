//! Adaptive throttling on clustered 429s.
//!
//! Provider rate limits tell us what we may send; clustered 429s tell us the
//! provider disagrees. Each `route::tenant=<id>` pair gets an escalating
//! local cooldown on repeated 429s, decaying lazily one step per touch after
//! a quiet period.

use crate::clock::Clock;
use crate::rate_limit::Resolution;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Tuning for the adaptive limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdaptiveConfig {
    /// Sliding window over which 429s are counted.
    pub window_ms: u64,
    /// 429s inside the window before a cooldown is imposed.
    pub threshold: usize,
    pub min_penalty_ms: u64,
    pub max_penalty_ms: u64,
    /// Geometric escalation factor per additional violation.
    pub penalty_multiplier: f64,
    /// Idle time after which a touch decays the penalty one step.
    pub decay_ms: u64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            threshold: 3,
            min_penalty_ms: 1_000,
            max_penalty_ms: 60_000,
            penalty_multiplier: 2.0,
            decay_ms: 30_000,
        }
    }
}

#[derive(Debug)]
struct AdaptiveEntry {
    hits: VecDeque<u64>,
    penalty_ms: u64,
    cooldown_until: Option<u64>,
    last_429_at: Option<u64>,
}

impl AdaptiveEntry {
    fn new() -> Self {
        Self { hits: VecDeque::new(), penalty_ms: 0, cooldown_until: None, last_429_at: None }
    }
}

/// Escalating per-`route::tenant` cooldowns on repeated 429s.
pub(crate) struct AdaptiveLimiter {
    config: AdaptiveConfig,
    entries: HashMap<String, AdaptiveEntry>,
    clock: Arc<dyn Clock>,
}

impl AdaptiveLimiter {
    pub fn new(config: AdaptiveConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, entries: HashMap::new(), clock }
    }

    /// Canonical limiter key.
    pub fn key(route: &str, tenant: &str) -> String {
        format!("{route}::tenant={tenant}")
    }

    /// One decay step when the key has been quiet long enough. Exactly one
    /// step per touch, regardless of how long the quiet period was.
    fn decay_step(config: &AdaptiveConfig, entry: &mut AdaptiveEntry, now: u64) {
        let Some(last) = entry.last_429_at else { return };
        if entry.penalty_ms == 0 || now.saturating_sub(last) < config.decay_ms {
            return;
        }
        let stepped = (entry.penalty_ms as f64 / config.penalty_multiplier.max(1.0)) as u64;
        entry.penalty_ms = if stepped < config.min_penalty_ms { 0 } else { stepped };
        // Re-arm so the next step needs another quiet period.
        entry.last_429_at = Some(now);
    }

    fn prune(config: &AdaptiveConfig, entry: &mut AdaptiveEntry, now: u64) {
        while entry.hits.front().is_some_and(|&t| now.saturating_sub(t) > config.window_ms) {
            entry.hits.pop_front();
        }
    }

    /// Is this key in cooldown right now?
    pub fn resolve(&mut self, key: &str) -> Resolution {
        let now = self.clock.now_millis();
        let Some(entry) = self.entries.get_mut(key) else {
            return Resolution::Proceed;
        };
        Self::decay_step(&self.config, entry, now);
        match entry.cooldown_until {
            Some(until) if now < until => Resolution::Wait { wake_up_at: Some(until) },
            _ => Resolution::Proceed,
        }
    }

    /// Record an upstream 429. The provider's `retry-after` stretches the
    /// cooldown when it is longer than the local penalty.
    pub fn record_429(&mut self, key: &str, retry_after: Option<Duration>) {
        let now = self.clock.now_millis();
        let config = self.config;
        let entry = self.entries.entry(key.to_string()).or_insert_with(AdaptiveEntry::new);

        Self::prune(&config, entry, now);
        entry.hits.push_back(now);
        entry.last_429_at = Some(now);

        if entry.hits.len() >= config.threshold {
            let escalated = if entry.penalty_ms == 0 {
                config.min_penalty_ms
            } else {
                ((entry.penalty_ms as f64 * config.penalty_multiplier) as u64)
                    .min(config.max_penalty_ms)
            };
            entry.penalty_ms = escalated;

            let provider_ms = retry_after.map(|d| d.as_millis() as u64).unwrap_or(0);
            let cooldown = escalated.max(provider_ms);
            entry.cooldown_until = Some(now + cooldown);
            tracing::warn!(key, penalty_ms = escalated, cooldown_ms = cooldown, "adaptive cooldown imposed");
        }
    }

    /// Record a success: decays the penalty and clears fully recovered keys.
    pub fn record_success(&mut self, key: &str) {
        let now = self.clock.now_millis();
        let config = self.config;
        let Some(entry) = self.entries.get_mut(key) else { return };

        Self::decay_step(&config, entry, now);
        Self::prune(&config, entry, now);

        let cooled = entry.cooldown_until.map_or(true, |until| now >= until);
        if entry.penalty_ms == 0 && entry.hits.is_empty() && cooled {
            self.entries.remove(key);
        }
    }

    #[cfg(test)]
    fn penalty_ms(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|e| e.penalty_ms)
    }
}

impl std::fmt::Debug for AdaptiveLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveLimiter")
            .field("config", &self.config)
            .field("entries", &self.entries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(clock: &ManualClock) -> AdaptiveLimiter {
        AdaptiveLimiter::new(AdaptiveConfig::default(), Arc::new(clock.clone()))
    }

    fn hit_threshold(limiter: &mut AdaptiveLimiter, key: &str) {
        for _ in 0..AdaptiveConfig::default().threshold {
            limiter.record_429(key, None);
        }
    }

    #[test]
    fn below_threshold_is_free() {
        let clock = ManualClock::new();
        let mut l = limiter(&clock);
        let key = AdaptiveLimiter::key("p::m", "acme");

        l.record_429(&key, None);
        l.record_429(&key, None);
        assert_eq!(l.resolve(&key), Resolution::Proceed);
    }

    #[test]
    fn threshold_imposes_min_penalty() {
        let clock = ManualClock::new();
        let mut l = limiter(&clock);
        let key = AdaptiveLimiter::key("p::m", "acme");

        hit_threshold(&mut l, &key);
        assert_eq!(l.resolve(&key), Resolution::Wait { wake_up_at: Some(1_000) });

        clock.set(1_000);
        assert_eq!(l.resolve(&key), Resolution::Proceed);
    }

    #[test]
    fn penalties_escalate_geometrically_to_the_cap() {
        let clock = ManualClock::new();
        let mut l = limiter(&clock);
        let key = AdaptiveLimiter::key("p::m", "acme");

        hit_threshold(&mut l, &key);
        assert_eq!(l.penalty_ms(&key), Some(1_000));
        l.record_429(&key, None);
        assert_eq!(l.penalty_ms(&key), Some(2_000));
        l.record_429(&key, None);
        assert_eq!(l.penalty_ms(&key), Some(4_000));

        for _ in 0..10 {
            l.record_429(&key, None);
        }
        assert_eq!(l.penalty_ms(&key), Some(60_000));
    }

    #[test]
    fn retry_after_stretches_the_cooldown() {
        let clock = ManualClock::new();
        let mut l = limiter(&clock);
        let key = AdaptiveLimiter::key("p::m", "acme");

        for _ in 0..2 {
            l.record_429(&key, None);
        }
        l.record_429(&key, Some(Duration::from_secs(30)));
        assert_eq!(l.resolve(&key), Resolution::Wait { wake_up_at: Some(30_000) });
    }

    #[test]
    fn decay_is_one_step_per_touch() {
        let clock = ManualClock::new();
        let mut l = limiter(&clock);
        let key = AdaptiveLimiter::key("p::m", "acme");

        hit_threshold(&mut l, &key);
        l.record_429(&key, None);
        l.record_429(&key, None);
        assert_eq!(l.penalty_ms(&key), Some(4_000));

        // A very long quiet period still only decays one step per touch.
        clock.advance(10 * 60_000);
        l.record_success(&key);
        assert_eq!(l.penalty_ms(&key), Some(2_000));

        clock.advance(60_000);
        l.record_success(&key);
        assert_eq!(l.penalty_ms(&key), Some(1_000));
    }

    #[test]
    fn full_decay_clears_the_entry() {
        let clock = ManualClock::new();
        let mut l = limiter(&clock);
        let key = AdaptiveLimiter::key("p::m", "acme");

        hit_threshold(&mut l, &key);
        assert_eq!(l.penalty_ms(&key), Some(1_000));

        // One decay step lands below the minimum, the window has drained,
        // and the cooldown has passed: the entry is gone.
        clock.advance(2 * 60_000);
        l.record_success(&key);
        assert!(l.penalty_ms(&key).is_none());
    }

    #[test]
    fn unknown_keys_proceed() {
        let clock = ManualClock::new();
        let mut l = limiter(&clock);
        assert_eq!(l.resolve("p::m::tenant=nobody"), Resolution::Proceed);
    }
}
