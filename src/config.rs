//! Controller configuration.

use crate::adaptive::AdaptiveConfig;
use crate::concurrency::LimitSpec;
use crate::events::EventSink;
use crate::request::{KeyBuilder, Priority};
use crate::retry::RetryOverrides;
use std::collections::HashMap;
use std::sync::Arc;

/// Provider-side budget for one route key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RouteLimits {
    pub requests_per_minute: u64,
    pub tokens_per_minute: u64,
    pub burst_size: Option<u64>,
}

/// Which limiter shape a route gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StrategyKind {
    /// Header-driven request window.
    Window,
    /// Config-paced token bucket.
    TokenBucket,
    /// Independent request + token windows (OpenAI header shape).
    DualWindow,
}

/// Per-provider and per-route strategy selection; routes win over providers.
#[derive(Debug, Clone, Default)]
pub struct StrategySelection {
    pub providers: HashMap<String, StrategyKind>,
    pub routes: HashMap<String, StrategyKind>,
}

/// Everything the controller can be tuned with. All fields have workable
/// defaults; an empty config runs unthrottled with unlimited concurrency.
#[derive(Clone, Default)]
pub struct TrafficConfig {
    /// Global in-flight cap. `None` means unlimited.
    pub max_concurrent: Option<u32>,
    pub max_concurrent_per_tenant: Option<LimitSpec>,
    pub max_concurrent_per_provider_model: Option<LimitSpec>,
    /// Route key → provider-side budget.
    pub rate_limits: HashMap<String, RouteLimits>,
    pub rate_limit_strategy: StrategySelection,
    /// Override for the default `"<provider>::<model>"` route-key derivation.
    pub rate_limit_key_builder: Option<KeyBuilder>,
    pub retry_policy: RetryOverrides,
    /// Origin model → ordered fallback targets.
    pub fallback_chains: HashMap<String, Vec<String>>,
    /// Soft cap on consecutive dispatches per priority within one drain;
    /// a fairness tie-breaker, not a correctness knob.
    pub priority_burst_limits: HashMap<Priority, u32>,
    /// Accepted for observability and future tie-breaking; unused by the
    /// scheduling decision itself.
    pub priority_weights: HashMap<Priority, u32>,
    pub adaptive: AdaptiveConfig,
    /// Event sink; defaults to [`crate::events::LogSink`].
    pub sink: Option<Arc<dyn EventSink>>,
}

impl std::fmt::Debug for TrafficConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrafficConfig")
            .field("max_concurrent", &self.max_concurrent)
            .field("max_concurrent_per_tenant", &self.max_concurrent_per_tenant)
            .field(
                "max_concurrent_per_provider_model",
                &self.max_concurrent_per_provider_model,
            )
            .field("rate_limits", &self.rate_limits)
            .field("rate_limit_strategy", &self.rate_limit_strategy)
            .field("has_key_builder", &self.rate_limit_key_builder.is_some())
            .field("retry_policy", &self.retry_policy)
            .field("fallback_chains", &self.fallback_chains)
            .field("priority_burst_limits", &self.priority_burst_limits)
            .field("adaptive", &self.adaptive)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_unrestricted() {
        let config = TrafficConfig::default();
        assert!(config.max_concurrent.is_none());
        assert!(config.rate_limits.is_empty());
        assert!(config.fallback_chains.is_empty());
    }
}
