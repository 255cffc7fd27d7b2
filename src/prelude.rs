//! Convenient re-exports for common Switchyard types.
pub use crate::{
    AdaptiveConfig, DispatchError, DispatchRequest, Headers, LimitSpec, LogSink, MemorySink,
    NullSink, Priority, RateLimitUpdate, RequestMetadata, RetryOverrides, RouteLimits,
    StrategyKind, StrategySelection, TokenUsage, TrafficConfig, TrafficController,
    TrafficEvent, UpstreamError,
};
