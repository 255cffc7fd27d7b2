//! Request records: the caller-facing typed request and its erased,
//! controller-owned form.
//!
//! A [`DispatchRequest`] carries the caller's work as opaque thunks. At
//! submission it is erased into a [`Job`] so the scheduler can hold requests
//! of different result types in one queue. The reply channel is shared
//! between a job and any fallback replacement created for it, so whichever
//! incarnation finishes settles the original caller's future.

use crate::error::{DispatchError, UpstreamError};
use crate::usage::TokenUsage;
use futures::future::BoxFuture;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Request priority. `P0` is highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Priority {
    P0,
    P1,
    P2,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::P0, Priority::P1, Priority::P2];

    pub(crate) fn index(self) -> usize {
        match self {
            Priority::P0 => 0,
            Priority::P1 => 1,
            Priority::P2 => 2,
        }
    }

    /// Parse a priority label; anything unrecognized maps to the default.
    pub fn parse(label: &str) -> Priority {
        match label.trim().to_ascii_uppercase().as_str() {
            "P0" => Priority::P0,
            "P2" => Priority::P2,
            _ => Priority::P1,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::P1
    }
}

/// Whether the caller's work resolves to a buffered value or starts a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Text,
    Stream,
}

/// Caller-supplied routing and accounting metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMetadata {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub priority: Option<Priority>,
    pub tenant_id: Option<String>,
    pub task_type: Option<String>,
    pub api_key_id: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
}

const UNKNOWN_SEGMENT: &str = "unknown";

/// Canonical `"<provider>::<model>"` route key.
pub fn route_key(metadata: &RequestMetadata) -> String {
    format!(
        "{}::{}",
        metadata.provider.as_deref().unwrap_or(UNKNOWN_SEGMENT),
        metadata.model.as_deref().unwrap_or(UNKNOWN_SEGMENT),
    )
}

/// Route key for a named fallback model on the same provider.
pub(crate) fn route_key_for_model(metadata: &RequestMetadata, model: &str) -> String {
    format!(
        "{}::{}",
        metadata.provider.as_deref().unwrap_or(UNKNOWN_SEGMENT),
        model,
    )
}

/// Override for the default route-key derivation. Must be deterministic and
/// pure: the same metadata must always produce the same key.
pub type KeyBuilder = Arc<dyn Fn(&RequestMetadata) -> String + Send + Sync>;

pub type ExecuteFn<T> =
    Box<dyn FnMut() -> BoxFuture<'static, Result<T, UpstreamError>> + Send>;
pub type FallbackFn<T> = Box<dyn FnMut(&str) -> Option<DispatchRequest<T>> + Send>;
pub type ExtractUsageFn<T> =
    Arc<dyn for<'a> Fn(&'a T) -> BoxFuture<'a, Option<TokenUsage>> + Send + Sync>;

/// A schedulable unit of caller work producing a `T`.
pub struct DispatchRequest<T> {
    pub(crate) metadata: RequestMetadata,
    pub(crate) execute: ExecuteFn<T>,
    pub(crate) fallback: Option<FallbackFn<T>>,
    pub(crate) extract_usage: Option<ExtractUsageFn<T>>,
    pub(crate) estimated_tokens: Option<u64>,
    pub(crate) max_queue_wait: Option<Duration>,
    pub(crate) deadline_at: Option<u64>,
}

impl<T> DispatchRequest<T> {
    pub fn builder() -> DispatchRequestBuilder<T> {
        DispatchRequestBuilder::new()
    }

    pub fn metadata(&self) -> &RequestMetadata {
        &self.metadata
    }
}

impl<T> std::fmt::Debug for DispatchRequest<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRequest")
            .field("metadata", &self.metadata)
            .field("estimated_tokens", &self.estimated_tokens)
            .field("max_queue_wait", &self.max_queue_wait)
            .field("deadline_at", &self.deadline_at)
            .finish()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum BuildError {
    MissingTenant,
    MissingExecute,
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::MissingTenant => write!(f, "tenant_id is required"),
            BuildError::MissingExecute => write!(f, "execute thunk is required"),
        }
    }
}

impl std::error::Error for BuildError {}

pub struct DispatchRequestBuilder<T> {
    metadata: RequestMetadata,
    execute: Option<ExecuteFn<T>>,
    fallback: Option<FallbackFn<T>>,
    extract_usage: Option<ExtractUsageFn<T>>,
    estimated_tokens: Option<u64>,
    max_queue_wait: Option<Duration>,
    deadline_at: Option<u64>,
}

impl<T> DispatchRequestBuilder<T> {
    pub fn new() -> Self {
        Self {
            metadata: RequestMetadata::default(),
            execute: None,
            fallback: None,
            extract_usage: None,
            estimated_tokens: None,
            max_queue_wait: None,
            deadline_at: None,
        }
    }

    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.metadata.tenant_id = Some(tenant.into());
        self
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.metadata.provider = Some(provider.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.metadata.model = Some(model.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.metadata.priority = Some(priority);
        self
    }

    pub fn metadata(mut self, metadata: RequestMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn execute<F, Fut>(mut self, mut f: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, UpstreamError>> + Send + 'static,
    {
        self.execute = Some(Box::new(move || Box::pin(f()) as BoxFuture<'static, _>));
        self
    }

    /// Factory producing a fresh request for a fallback model, or `None` to
    /// decline the nomination.
    pub fn fallback<F>(mut self, f: F) -> Self
    where
        F: FnMut(&str) -> Option<DispatchRequest<T>> + Send + 'static,
    {
        self.fallback = Some(Box::new(f));
        self
    }

    /// Synchronous usage extraction from a successful result.
    pub fn usage<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) -> Option<TokenUsage> + Send + Sync + 'static,
    {
        let extract: ExtractUsageFn<T> = Arc::new(move |value| {
            let usage = f(value);
            Box::pin(std::future::ready(usage))
        });
        self.extract_usage = Some(extract);
        self
    }

    /// Asynchronous usage extraction (for callers that must await the tail of
    /// a stream to learn its token counts).
    pub fn usage_async<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(&'a T) -> BoxFuture<'a, Option<TokenUsage>> + Send + Sync + 'static,
    {
        self.extract_usage = Some(Arc::new(f));
        self
    }

    /// Token-window pre-reservation hint.
    pub fn estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = Some(tokens);
        self
    }

    /// Reject the request if it has not dispatched within this long of
    /// enqueueing.
    pub fn max_queue_wait(mut self, wait: Duration) -> Self {
        self.max_queue_wait = Some(wait);
        self
    }

    /// Absolute queue-wait deadline in controller-clock milliseconds. When
    /// both this and [`max_queue_wait`](Self::max_queue_wait) are set, the
    /// earlier wins.
    pub fn deadline_at(mut self, deadline_ms: u64) -> Self {
        self.deadline_at = Some(deadline_ms);
        self
    }

    pub fn build(self) -> Result<DispatchRequest<T>, BuildError> {
        if self.metadata.tenant_id.as_deref().map_or(true, str::is_empty) {
            return Err(BuildError::MissingTenant);
        }
        let execute = self.execute.ok_or(BuildError::MissingExecute)?;
        Ok(DispatchRequest {
            metadata: self.metadata,
            execute,
            fallback: self.fallback,
            extract_usage: self.extract_usage,
            estimated_tokens: self.estimated_tokens,
            max_queue_wait: self.max_queue_wait,
            deadline_at: self.deadline_at,
        })
    }
}

impl<T> Default for DispatchRequestBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one run of a job's execute thunk.
#[derive(Debug)]
pub(crate) enum RunOutcome {
    /// The value was delivered to the caller; `usage` is whatever the job's
    /// extractor produced.
    Delivered { usage: Option<TokenUsage> },
    /// The run failed; the reply channel is still armed for a retry or a
    /// final rejection.
    Failed(UpstreamError),
}

pub(crate) type SharedReply<T> =
    Arc<Mutex<Option<oneshot::Sender<Result<T, DispatchError>>>>>;

type RunFn = Box<dyn FnMut() -> BoxFuture<'static, RunOutcome> + Send>;
type MakeFallbackFn = Box<dyn FnMut(&str) -> Option<Job> + Send>;
type RejectFn = Box<dyn FnMut(DispatchError) + Send>;

/// Type-erased request record owned by the scheduler.
pub(crate) struct Job {
    pub(crate) kind: RequestKind,
    pub(crate) tenant: String,
    pub(crate) metadata: RequestMetadata,
    pub(crate) estimated_tokens: Option<u64>,
    pub(crate) max_queue_wait: Option<Duration>,
    pub(crate) deadline_hint: Option<u64>,
    run: RunFn,
    make_fallback: Option<MakeFallbackFn>,
    reject_fn: RejectFn,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("kind", &self.kind)
            .field("tenant", &self.tenant)
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl Job {
    /// Erase a typed request, wiring its reply channel so success delivers
    /// the value and failure leaves the channel armed.
    pub(crate) fn erase<T: Send + 'static>(
        request: DispatchRequest<T>,
        reply: SharedReply<T>,
        kind: RequestKind,
    ) -> Job {
        let DispatchRequest {
            metadata,
            mut execute,
            fallback,
            extract_usage,
            estimated_tokens,
            max_queue_wait,
            deadline_at,
        } = request;

        let tenant = metadata.tenant_id.clone().unwrap_or_default();

        let run_reply = reply.clone();
        let run: RunFn = Box::new(move || {
            let call = (execute)();
            let reply = run_reply.clone();
            let usage_fn = extract_usage.clone();
            Box::pin(async move {
                match call.await {
                    Ok(value) => {
                        let usage = match &usage_fn {
                            Some(extract) => extract(&value).await,
                            None => None,
                        };
                        let sender =
                            reply.lock().unwrap_or_else(|p| p.into_inner()).take();
                        if let Some(tx) = sender {
                            let _ = tx.send(Ok(value));
                        }
                        RunOutcome::Delivered { usage }
                    }
                    Err(error) => RunOutcome::Failed(error.normalize()),
                }
            }) as BoxFuture<'static, RunOutcome>
        });

        let make_fallback = fallback.map(|mut factory| {
            let reply = reply.clone();
            Box::new(move |target: &str| {
                let produced = catch_unwind(AssertUnwindSafe(|| factory(target)));
                match produced {
                    Ok(request) => {
                        request.map(|r| Job::erase(r, reply.clone(), kind))
                    }
                    Err(_) => {
                        tracing::warn!(model = target, "fallback factory panicked; skipping candidate");
                        None
                    }
                }
            }) as MakeFallbackFn
        });

        let reject_reply = reply;
        let reject_fn: RejectFn = Box::new(move |error| {
            let sender = reject_reply.lock().unwrap_or_else(|p| p.into_inner()).take();
            if let Some(tx) = sender {
                let _ = tx.send(Err(error));
            }
        });

        Job {
            kind,
            tenant,
            metadata,
            estimated_tokens,
            max_queue_wait,
            deadline_hint: deadline_at,
            run,
            make_fallback,
            reject_fn,
        }
    }

    /// Produce one run of the caller's work. The returned future owns
    /// everything it needs; the job stays behind for retries.
    pub(crate) fn run(&mut self) -> BoxFuture<'static, RunOutcome> {
        (self.run)()
    }

    pub(crate) fn has_fallback(&self) -> bool {
        self.make_fallback.is_some()
    }

    /// Ask the caller's factory for a replacement targeting `model`. The
    /// replacement settles the same caller future as this job.
    pub(crate) fn fallback(&mut self, model: &str) -> Option<Job> {
        let factory = self.make_fallback.as_mut()?;
        factory(model)
    }

    /// Settle the caller with an error. Later calls are no-ops.
    pub(crate) fn reject(mut self, error: DispatchError) {
        (self.reject_fn)(error);
    }
}
