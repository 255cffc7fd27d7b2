//! Retry planning: error classification, capped exponential backoff with
//! jitter, and caller policy overrides.
//!
//! The planner is a pure function of `(error, attempt, route)`; it never
//! sleeps. The dispatcher schedules the produced delay.

use crate::backoff::{Backoff, Jitter};
use crate::error::UpstreamError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Total attempts allowed for retryable errors.
pub const MAX_RETRY_ATTEMPTS: u32 = 3;
/// Stricter cap for timeouts: a route that times out is usually overloaded.
pub const TIMEOUT_RETRY_ATTEMPTS: u32 = 2;

const RATE_LIMIT_BASE: Duration = Duration::from_millis(1_000);
const SERVER_ERROR_BASE: Duration = Duration::from_millis(500);
const TIMEOUT_BASE: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const JITTER_FACTOR: f64 = 0.25;

/// Why an error is considered retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    RateLimit,
    ServerError,
    Timeout,
}

/// A scheduled retry: re-enqueue after `delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPlan {
    pub reason: RetryReason,
    pub delay: Duration,
}

/// What a policy override decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyVerdict {
    /// Use this plan verbatim.
    Plan(RetryPlan),
    /// Do not retry.
    NoRetry,
    /// Fall through to the built-in heuristics.
    Defer,
}

pub type RetryPolicyFn = Arc<dyn Fn(&UpstreamError, u32) -> PolicyVerdict + Send + Sync>;

/// Policy overrides consulted before the heuristics: most specific first
/// (route key or model, then provider, then default).
#[derive(Clone, Default)]
pub struct RetryOverrides {
    pub default: Option<RetryPolicyFn>,
    pub providers: HashMap<String, RetryPolicyFn>,
    pub models: HashMap<String, RetryPolicyFn>,
}

impl std::fmt::Debug for RetryOverrides {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOverrides")
            .field("default", &self.default.is_some())
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn status_reason(status: u16) -> Option<RetryReason> {
    match status {
        429 => Some(RetryReason::RateLimit),
        408 => Some(RetryReason::Timeout),
        s if s >= 500 => Some(RetryReason::ServerError),
        _ => None,
    }
}

fn looks_like_timeout(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("timed out") || lower.contains("timedout") || lower.contains("timeout")
}

/// Classify an upstream error into a retry reason, if any.
///
/// Typed variants win; opaque errors get their status extracted (walking the
/// source chain) and finally a timeout sniff over each chained message.
pub fn classify(error: &UpstreamError) -> Option<RetryReason> {
    match error {
        UpstreamError::RateLimited { .. } => return Some(RetryReason::RateLimit),
        UpstreamError::Timeout { .. } => return Some(RetryReason::Timeout),
        UpstreamError::Status { status, .. } => return status_reason(*status),
        UpstreamError::Other(_) => {}
    }

    if let Some(status) = error.status() {
        if let Some(reason) = status_reason(status) {
            return Some(reason);
        }
    }

    let mut cursor: Option<&(dyn std::error::Error + 'static)> = match error {
        UpstreamError::Other(e) => Some(e.as_ref()),
        _ => None,
    };
    while let Some(err) = cursor {
        if looks_like_timeout(&err.to_string()) {
            return Some(RetryReason::Timeout);
        }
        cursor = err.source();
    }
    None
}

/// Computes retry plans for failed dispatches.
pub struct RetryPlanner {
    overrides: RetryOverrides,
    jitter: Jitter,
}

impl std::fmt::Debug for RetryPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPlanner")
            .field("overrides", &self.overrides)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl RetryPlanner {
    pub fn new(overrides: RetryOverrides) -> Self {
        Self { overrides, jitter: Jitter::proportional(JITTER_FACTOR) }
    }

    /// Disable jitter (deterministic tests).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = Jitter::None;
        self
    }

    fn lookup_override(
        &self,
        route: &str,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> Option<&RetryPolicyFn> {
        if let Some(policy) = self.overrides.models.get(route) {
            return Some(policy);
        }
        if let Some(policy) = model.and_then(|m| self.overrides.models.get(m)) {
            return Some(policy);
        }
        if let Some(policy) = provider.and_then(|p| self.overrides.providers.get(p)) {
            return Some(policy);
        }
        self.overrides.default.as_ref()
    }

    /// Plan a retry for `attempt` (1-indexed: the attempt that just failed).
    /// Returns `None` when the error is terminal or the budget is spent.
    pub fn plan(
        &self,
        error: &UpstreamError,
        attempt: u32,
        route: &str,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> Option<RetryPlan> {
        if let Some(policy) = self.lookup_override(route, provider, model) {
            match policy(error, attempt) {
                PolicyVerdict::Plan(plan) => return Some(plan),
                PolicyVerdict::NoRetry => return None,
                PolicyVerdict::Defer => {}
            }
        }

        let reason = classify(error)?;
        let cap = match reason {
            RetryReason::Timeout => TIMEOUT_RETRY_ATTEMPTS,
            _ => MAX_RETRY_ATTEMPTS,
        };
        if attempt >= cap {
            return None;
        }

        let base = match reason {
            RetryReason::RateLimit => RATE_LIMIT_BASE,
            RetryReason::ServerError => SERVER_ERROR_BASE,
            RetryReason::Timeout => TIMEOUT_BASE,
        };
        let exp = Backoff::exponential(base).with_max(MAX_BACKOFF).delay(attempt);
        let mut delay = self.jitter.apply(exp);

        if reason == RetryReason::RateLimit {
            if let Some(retry_after) = error.retry_after() {
                delay = delay.max(retry_after);
            }
        }

        Some(RetryPlan { reason, delay })
    }
}
