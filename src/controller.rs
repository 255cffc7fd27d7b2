//! Public controller surface.
//!
//! Submit requests with [`TrafficController::handle_text`] /
//! [`TrafficController::handle_stream`]; feed back provider headers and
//! post-start stream failures through the side entrypoints. The controller
//! must live inside a tokio runtime: dispatch and timers run on spawned
//! tasks.

use crate::circuit::CircuitStatus;
use crate::clock::{Clock, MonotonicClock};
use crate::config::TrafficConfig;
use crate::dispatcher::Inner;
use crate::error::{DispatchError, UpstreamError};
use crate::headers::Headers;
use crate::rate_limit::RateLimitUpdate;
use crate::request::{DispatchRequest, Job, RequestKind, RequestMetadata, SharedReply};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::usage::TenantUsage;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::oneshot;

/// Traffic controller for externally rate-limited calls.
///
/// Cheap to clone; clones share all scheduling state.
#[derive(Clone)]
pub struct TrafficController {
    inner: Arc<Inner>,
}

impl TrafficController {
    pub fn new(config: TrafficConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: TrafficConfig) -> TrafficControllerBuilder {
        TrafficControllerBuilder {
            config,
            clock: None,
            sleeper: None,
        }
    }

    /// Submit a buffered-response request.
    pub async fn handle_text<T: Send + 'static>(
        &self,
        request: DispatchRequest<T>,
    ) -> Result<T, DispatchError> {
        self.handle(request, RequestKind::Text).await
    }

    /// Submit a streaming request. Scheduling is identical to text; the
    /// distinction matters for post-start failures, which arrive through
    /// [`report_stream_failure`](Self::report_stream_failure) instead of the
    /// dispatch result.
    pub async fn handle_stream<T: Send + 'static>(
        &self,
        request: DispatchRequest<T>,
    ) -> Result<T, DispatchError> {
        self.handle(request, RequestKind::Stream).await
    }

    async fn handle<T: Send + 'static>(
        &self,
        request: DispatchRequest<T>,
        kind: RequestKind,
    ) -> Result<T, DispatchError> {
        let (tx, rx) = oneshot::channel();
        let reply: SharedReply<T> = Arc::new(Mutex::new(Some(tx)));
        let job = Job::erase(request, reply, kind);
        Arc::clone(&self.inner).submit(job);
        rx.await.unwrap_or(Err(DispatchError::Shutdown))
    }

    /// Report a stream that failed after it started; counts against the
    /// route's circuit (and the adaptive limiter on 429s) with the same
    /// eligibility rules as dispatch failures.
    pub fn report_stream_failure(&self, metadata: &RequestMetadata, error: &UpstreamError) {
        Arc::clone(&self.inner).report_stream_failure(metadata, error);
    }

    /// Ingest rate-limit headers observed on any provider response, success
    /// or error. Returns a post-update snapshot for observability.
    pub fn update_rate_limit_from_headers(
        &self,
        metadata: &RequestMetadata,
        headers: &Headers,
    ) -> Option<RateLimitUpdate> {
        Arc::clone(&self.inner).update_from_headers(metadata, headers)
    }

    /// Running token totals for a tenant.
    pub fn tenant_usage(&self, tenant_id: &str) -> Option<TenantUsage> {
        self.inner.tenant_usage(tenant_id)
    }

    /// Current circuit status for the route this metadata maps to.
    pub fn circuit_status(&self, metadata: &RequestMetadata) -> CircuitStatus {
        self.inner.circuit_status(metadata)
    }
}

impl std::fmt::Debug for TrafficController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TrafficController")
    }
}

pub struct TrafficControllerBuilder {
    config: TrafficConfig,
    clock: Option<Arc<dyn Clock>>,
    sleeper: Option<Arc<dyn Sleeper>>,
}

impl TrafficControllerBuilder {
    /// Override the clock (deterministic tests).
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Override the sleeper (deterministic tests).
    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Some(Arc::new(sleeper));
        self
    }

    pub fn build(self) -> TrafficController {
        let clock = self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::default()));
        let sleeper = self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper));
        TrafficController {
            inner: Arc::new(Inner::new(self.config, clock, sleeper)),
        }
    }
}

static GLOBAL: OnceLock<TrafficController> = OnceLock::new();

/// Process-wide controller, built from `config` on first call; later calls
/// ignore their argument and return the memoized instance.
pub fn global(config: impl FnOnce() -> TrafficConfig) -> &'static TrafficController {
    GLOBAL.get_or_init(|| TrafficController::new(config()))
}
