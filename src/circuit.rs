//! Per-route circuit breaker.
//!
//! Each route gets a lazily created state machine: closed until enough
//! eligible failures land inside the rolling window, open until the cooldown
//! elapses, then half-open for exactly one trial request. Ineligible
//! failures delete the state outright (an error that isn't the provider's
//! fault says nothing about route health).

use crate::clock::Clock;
use crate::error::UpstreamError;
use crate::retry::{classify, RetryReason};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

pub(crate) const FAILURE_THRESHOLD: usize = 5;
pub(crate) const FAILURE_WINDOW_MS: u64 = 60_000;
pub(crate) const COOLDOWN_MS: u64 = 30_000;
pub(crate) const TIMEOUT_THRESHOLD: usize = 3;
pub(crate) const TIMEOUT_WINDOW_MS: u64 = 60_000;
/// Retry hint handed out while a half-open trial is already in flight.
pub(crate) const TRIAL_BUSY_RETRY_MS: u64 = 1_000;

/// Observable status of a route's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

/// How a failed call counts against a route's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 429 or 5xx: counts toward the failure window.
    Eligible,
    /// Timeout: counts toward the separate timeout window.
    Timeout,
    /// Anything else: clears the route's state.
    Other,
}

impl FailureKind {
    pub fn from_error(error: &UpstreamError) -> Self {
        match classify(error) {
            Some(RetryReason::RateLimit) | Some(RetryReason::ServerError) => {
                FailureKind::Eligible
            }
            Some(RetryReason::Timeout) => FailureKind::Timeout,
            None => FailureKind::Other,
        }
    }
}

#[derive(Debug)]
struct CircuitEntry {
    status: CircuitStatus,
    failure_times: VecDeque<u64>,
    timeout_times: VecDeque<u64>,
    opened_at: Option<u64>,
    trial_in_flight: bool,
}

impl CircuitEntry {
    fn new() -> Self {
        Self {
            status: CircuitStatus::Closed,
            failure_times: VecDeque::new(),
            timeout_times: VecDeque::new(),
            opened_at: None,
            trial_in_flight: false,
        }
    }

    fn prune(&mut self, now: u64) {
        while self
            .failure_times
            .front()
            .is_some_and(|&t| now.saturating_sub(t) > FAILURE_WINDOW_MS)
        {
            self.failure_times.pop_front();
        }
        while self
            .timeout_times
            .front()
            .is_some_and(|&t| now.saturating_sub(t) > TIMEOUT_WINDOW_MS)
        {
            self.timeout_times.pop_front();
        }
    }

    fn open(&mut self, now: u64) {
        self.status = CircuitStatus::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
        self.failure_times.clear();
        self.timeout_times.clear();
    }

    fn cooldown_remaining(&self, now: u64) -> u64 {
        match self.opened_at {
            Some(at) => COOLDOWN_MS.saturating_sub(now.saturating_sub(at)),
            None => 0,
        }
    }
}

/// Admission result for one route, valid within a single resolve pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CircuitDecision {
    /// Proceed; `trial` marks the single half-open probe.
    Allow { trial: bool },
    /// Rejected; retry no sooner than the hint.
    Open { retry_after_ms: u64 },
}

/// Route-keyed circuit state plus the fallback-chain table.
pub(crate) struct CircuitBreaker {
    entries: HashMap<String, CircuitEntry>,
    chains: HashMap<String, Vec<String>>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(chains: HashMap<String, Vec<String>>, clock: Arc<dyn Clock>) -> Self {
        Self { entries: HashMap::new(), chains, clock }
    }

    pub fn status(&self, route: &str) -> CircuitStatus {
        self.entries.get(route).map_or(CircuitStatus::Closed, |e| e.status)
    }

    /// Ordered fallback targets for an origin model, if configured.
    pub fn fallback_chain(&self, model: &str) -> Option<&[String]> {
        self.chains.get(model).map(Vec::as_slice)
    }

    /// May this route dispatch right now? Transitions open → half-open when
    /// the cooldown has elapsed.
    pub fn admit(&mut self, route: &str) -> CircuitDecision {
        let now = self.clock.now_millis();
        let Some(entry) = self.entries.get_mut(route) else {
            return CircuitDecision::Allow { trial: false };
        };

        match entry.status {
            CircuitStatus::Closed => CircuitDecision::Allow { trial: false },
            CircuitStatus::Open => {
                let remaining = entry.cooldown_remaining(now);
                if remaining == 0 {
                    entry.status = CircuitStatus::HalfOpen;
                    entry.trial_in_flight = false;
                    tracing::info!(route, "circuit half-open, admitting trial");
                    CircuitDecision::Allow { trial: true }
                } else {
                    CircuitDecision::Open { retry_after_ms: remaining }
                }
            }
            CircuitStatus::HalfOpen => {
                if entry.trial_in_flight {
                    CircuitDecision::Open { retry_after_ms: TRIAL_BUSY_RETRY_MS }
                } else {
                    CircuitDecision::Allow { trial: true }
                }
            }
        }
    }

    /// Record that the admitted trial actually dispatched.
    pub fn mark_trial(&mut self, route: &str) {
        if let Some(entry) = self.entries.get_mut(route) {
            entry.trial_in_flight = true;
        }
    }

    /// Success clears the route entirely (half-open trial included).
    pub fn record_success(&mut self, route: &str) -> bool {
        let was_open = self
            .entries
            .get(route)
            .is_some_and(|e| e.status != CircuitStatus::Closed);
        if self.entries.remove(route).is_some() && was_open {
            tracing::info!(route, "circuit closed");
        }
        was_open
    }

    /// Record a failure; returns `true` when this call opened the circuit.
    pub fn record_failure(&mut self, route: &str, kind: FailureKind) -> bool {
        if kind == FailureKind::Other {
            // Says nothing about route health; forget what we had.
            self.entries.remove(route);
            return false;
        }

        let now = self.clock.now_millis();
        let entry = self.entries.entry(route.to_string()).or_insert_with(CircuitEntry::new);
        entry.prune(now);

        if entry.status == CircuitStatus::HalfOpen {
            tracing::warn!(route, "half-open trial failed, reopening circuit");
            entry.open(now);
            return true;
        }

        let tripped = match kind {
            FailureKind::Eligible => {
                entry.failure_times.push_back(now);
                entry.failure_times.len() >= FAILURE_THRESHOLD
            }
            FailureKind::Timeout => {
                entry.timeout_times.push_back(now);
                entry.timeout_times.len() >= TIMEOUT_THRESHOLD
            }
            FailureKind::Other => unreachable!(),
        };

        if tripped && entry.status == CircuitStatus::Closed {
            tracing::warn!(route, "failure threshold reached, opening circuit");
            entry.open(now);
            return true;
        }
        false
    }

    /// Remaining cooldown for an open route, for error hints.
    pub fn retry_after_ms(&self, route: &str) -> Option<u64> {
        let entry = self.entries.get(route)?;
        match entry.status {
            CircuitStatus::Open => Some(entry.cooldown_remaining(self.clock.now_millis())),
            CircuitStatus::HalfOpen => Some(TRIAL_BUSY_RETRY_MS),
            CircuitStatus::Closed => None,
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("entries", &self.entries)
            .field("chains", &self.chains)
            .finish()
    }
}
