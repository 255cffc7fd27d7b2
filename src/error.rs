//! Error types for the traffic controller.
//!
//! Two layers: [`UpstreamError`] is the currency of the caller's `execute`
//! thunk (what the provider call failed with), and [`DispatchError`] is what
//! the controller itself surfaces to the submitting caller.

use std::time::Duration;
use thiserror::Error;

/// Failure reported by a caller's `execute` thunk.
///
/// Callers map raw provider errors into these variants; anything that doesn't
/// fit goes through [`UpstreamError::Other`], and the retry classifier will
/// still walk the source chain for embedded status or timeout information.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Upstream 429. `retry_after` is the provider's hint, when present.
    #[error("upstream rate limited (429)")]
    RateLimited {
        retry_after: Option<Duration>,
        tenant: Option<String>,
        key: Option<String>,
    },
    /// Any other HTTP-style status failure.
    #[error("upstream returned status {status}")]
    Status {
        status: u16,
        retry_after: Option<Duration>,
        message: Option<String>,
    },
    /// The call timed out client-side.
    #[error("upstream call timed out")]
    Timeout { elapsed: Option<Duration> },
    /// Opaque failure; classification falls back to source-chain inspection.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl UpstreamError {
    pub fn other<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }

    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        Self::Status { status, retry_after, message: None }.normalize()
    }

    /// Fold raw 429 statuses into [`UpstreamError::RateLimited`].
    pub fn normalize(self) -> Self {
        match self {
            Self::Status { status: 429, retry_after, .. } => {
                Self::RateLimited { retry_after, tenant: None, key: None }
            }
            other => other,
        }
    }

    /// HTTP-like status carried by this error, walking the source chain for
    /// wrapped errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimited { .. } => Some(429),
            Self::Status { status, .. } => Some(*status),
            Self::Timeout { .. } => None,
            Self::Other(e) => find_in_chain(e.as_ref(), |u| u.status()),
        }
    }

    /// Provider `retry-after` hint, walking the source chain for wrapped
    /// errors.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } | Self::Status { retry_after, .. } => {
                *retry_after
            }
            Self::Timeout { .. } => None,
            Self::Other(e) => find_in_chain(e.as_ref(), |u| u.retry_after()),
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status() == Some(429)
    }
}

/// Search an error's source chain for a wrapped [`UpstreamError`] and project
/// a value out of the first one that yields `Some`.
fn find_in_chain<T>(
    top: &(dyn std::error::Error + 'static),
    project: impl Fn(&UpstreamError) -> Option<T>,
) -> Option<T> {
    let mut cursor: Option<&(dyn std::error::Error + 'static)> = Some(top);
    while let Some(err) = cursor {
        if let Some(upstream) = err.downcast_ref::<UpstreamError>() {
            if let Some(value) = project(upstream) {
                return Some(value);
            }
        }
        cursor = err.source();
    }
    None
}

/// Errors the controller surfaces to submitting callers.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The request's queue-wait deadline elapsed before dispatch.
    #[error("request timed out after {waited:?} waiting in queue")]
    QueueWaitTimeout {
        waited: Duration,
        max_queue_wait: Option<Duration>,
        deadline_at: u64,
    },
    /// The route's circuit is open and no fallback was available.
    #[error("circuit open for route {route}")]
    CircuitOpen {
        route: String,
        retry_after: Option<Duration>,
    },
    /// The upstream call failed terminally (retries exhausted or ineligible).
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    /// The controller was dropped before the request settled.
    #[error("controller shut down before the request settled")]
    Shutdown,
}

impl DispatchError {
    pub fn is_queue_timeout(&self) -> bool {
        matches!(self, Self::QueueWaitTimeout { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Borrow the upstream error if this is an `Upstream` variant.
    pub fn as_upstream(&self) -> Option<&UpstreamError> {
        match self {
            Self::Upstream(e) => Some(e),
            _ => None,
        }
    }
}
