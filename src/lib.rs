#![forbid(unsafe_code)]

//! # Switchyard
//!
//! An in-process traffic controller for externally rate-limited calls, LLM
//! providers foremost. Many tenants submit work against many
//! `(provider, model)` routes; the controller continuously decides which
//! pending request executes now and which waits, composing four control
//! planes over one dispatch decision:
//!
//! - **Priority queueing** (`P0 > P1 > P2`, FIFO within a priority)
//! - **Concurrency gating** (global, per-tenant, per-route in-flight caps)
//! - **Provider rate limits** (header-driven windows, token buckets, and an
//!   OpenAI-style dual request/token window)
//! - **Circuit breaking** with per-model fallback chains
//!
//! plus the failure paths that feed back into them: retry backoff with
//! jitter, queue-wait deadlines, and adaptive penalties on clustered 429s.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::collections::HashMap;
//! use switchyard::{
//!     DispatchRequest, Priority, RouteLimits, TokenUsage, TrafficConfig,
//!     TrafficController, UpstreamError,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut rate_limits = HashMap::new();
//!     rate_limits.insert(
//!         "openai::gpt-4o".to_string(),
//!         RouteLimits { requests_per_minute: 60, tokens_per_minute: 90_000, burst_size: None },
//!     );
//!     let controller = TrafficController::new(TrafficConfig {
//!         max_concurrent: Some(32),
//!         rate_limits,
//!         ..Default::default()
//!     });
//!
//!     let request = DispatchRequest::builder()
//!         .tenant("acme")
//!         .provider("openai")
//!         .model("gpt-4o")
//!         .priority(Priority::P0)
//!         .estimated_tokens(1_500)
//!         .execute(|| async {
//!             // The actual provider call goes here.
//!             Ok::<_, UpstreamError>("completion text".to_string())
//!         })
//!         .usage(|_response| Some(TokenUsage::totals(1_200, 300)))
//!         .build()?;
//!
//!     let response = controller.handle_text(request).await?;
//!     println!("{response}");
//!     Ok(())
//! }
//! ```
//!
//! The code making the provider call should feed observed `x-ratelimit-*`
//! headers back through
//! [`TrafficController::update_rate_limit_from_headers`], and report
//! post-start stream failures through
//! [`TrafficController::report_stream_failure`].

mod adaptive;
mod backoff;
mod circuit;
mod clock;
mod concurrency;
mod config;
mod controller;
mod deadline;
mod dispatcher;
mod error;
mod events;
mod headers;
pub mod prelude;
mod rate_limit;
mod request;
mod retry;
mod sleeper;
mod usage;

pub use adaptive::AdaptiveConfig;
pub use backoff::{Backoff, Jitter};
pub use circuit::CircuitStatus;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use concurrency::{GateFull, LimitSpec};
pub use config::{RouteLimits, StrategyKind, StrategySelection, TrafficConfig};
pub use controller::{global, TrafficController, TrafficControllerBuilder};
pub use error::{DispatchError, UpstreamError};
pub use events::{EventSink, LogSink, MemorySink, NullSink, TrafficEvent};
pub use headers::Headers;
pub use rate_limit::{
    dual_window::DualWindowStrategy, token_bucket::TokenBucketStrategy,
    window::WindowStrategy, RateLimitStrategy, RateLimitUpdate, Resolution, WindowSnapshot,
};
pub use request::{
    route_key, BuildError, DispatchRequest, DispatchRequestBuilder, KeyBuilder, Priority,
    RequestKind, RequestMetadata,
};
pub use retry::{
    classify, PolicyVerdict, RetryOverrides, RetryPlan, RetryPlanner, RetryPolicyFn,
    RetryReason, MAX_RETRY_ATTEMPTS, TIMEOUT_RETRY_ATTEMPTS,
};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use usage::{TenantUsage, TokenUsage};
