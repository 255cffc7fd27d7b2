//! The dispatch loop.
//!
//! All scheduling state lives in one `CoreState` behind a mutex; drain
//! passes, completions, timer fires, and header ingestion are the only
//! mutators and each holds the lock briefly. Caller work runs on spawned
//! tasks and re-enters through [`Inner::complete`].
//!
//! A drain pass: sweep queue deadlines, short-circuit when the global gate is
//! saturated, then scan priority heads P0 → P2 through the gauntlet of
//! concurrency → circuit (with fallback navigation) → adaptive → rate limit.
//! A head that must wait never blocks runnable lower-priority work.

use crate::adaptive::AdaptiveLimiter;
use crate::circuit::{CircuitBreaker, CircuitDecision, CircuitStatus, FailureKind};
use crate::clock::Clock;
use crate::concurrency::{ConcurrencyDecision, ConcurrencyLimiter, GateKeys};
use crate::config::TrafficConfig;
use crate::deadline::DeadlineHeap;
use crate::error::{DispatchError, UpstreamError};
use crate::events::{emit_best_effort, EventSink, TrafficEvent};
use crate::headers::Headers;
use crate::rate_limit::coordinator::RateLimitCoordinator;
use crate::rate_limit::{RateLimitUpdate, Resolution};
use crate::request::{self, Job, KeyBuilder, Priority, RequestMetadata, RunOutcome};
use crate::retry::RetryPlanner;
use crate::sleeper::Sleeper;
use crate::usage::{TenantUsage, TokenUsage, UsageTracker};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

/// A request waiting in its priority queue (the queue index encodes the
/// priority).
struct QueuedJob {
    id: u64,
    job: Job,
    attempt: u32,
    enqueued_at: u64,
    deadline_at: Option<u64>,
    queue_timeout_disabled: bool,
}

/// A dispatched request awaiting completion.
struct InFlight {
    job: Job,
    priority: Priority,
    attempt: u32,
    route: String,
    gates: GateKeys,
    reserved_tokens: Option<u64>,
}

#[derive(Default)]
struct WakeupSlot {
    at: Option<u64>,
    handle: Option<JoinHandle<()>>,
}

struct CoreState {
    queues: [VecDeque<QueuedJob>; 3],
    deadlines: DeadlineHeap,
    concurrency: ConcurrencyLimiter,
    circuits: CircuitBreaker,
    adaptive: AdaptiveLimiter,
    coordinator: RateLimitCoordinator,
    usage: UsageTracker,
    planner: RetryPlanner,
    in_flight: HashMap<u64, InFlight>,
    /// Consecutive dispatches per priority, for burst suppression.
    streaks: [u32; 3],
    next_id: u64,
    wakeup: WakeupSlot,
}

/// Shared controller internals. The facade and every timer/completion task
/// hold an `Arc` of this.
pub(crate) struct Inner {
    state: Mutex<CoreState>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    sink: Arc<dyn EventSink>,
    key_builder: Option<KeyBuilder>,
    burst_limits: HashMap<Priority, u32>,
}

struct PassResult {
    launch: Option<(u64, Priority, BoxFuture<'static, RunOutcome>)>,
    wake_at: Option<u64>,
    /// A head was rejected mid-scan; the pass should be re-run.
    rescan: bool,
}

fn merge_wake(current: &mut Option<u64>, candidate: Option<u64>) {
    if let Some(at) = candidate {
        *current = Some(current.map_or(at, |cur| cur.min(at)));
    }
}

impl Inner {
    pub fn new(
        config: TrafficConfig,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let sink = config
            .sink
            .clone()
            .unwrap_or_else(|| Arc::new(crate::events::LogSink));
        let state = CoreState {
            queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            deadlines: DeadlineHeap::new(),
            concurrency: ConcurrencyLimiter::new(
                config.max_concurrent,
                config.max_concurrent_per_tenant.clone(),
                config.max_concurrent_per_provider_model.clone(),
            ),
            circuits: CircuitBreaker::new(config.fallback_chains.clone(), clock.clone()),
            adaptive: AdaptiveLimiter::new(config.adaptive, clock.clone()),
            coordinator: RateLimitCoordinator::new(
                config.rate_limits.clone(),
                config.rate_limit_strategy.clone(),
                clock.clone(),
            ),
            usage: UsageTracker::new(),
            planner: RetryPlanner::new(config.retry_policy.clone()),
            in_flight: HashMap::new(),
            streaks: [0; 3],
            next_id: 0,
            wakeup: WakeupSlot::default(),
        };
        Self {
            state: Mutex::new(state),
            clock,
            sleeper,
            sink,
            key_builder: config.rate_limit_key_builder,
            burst_limits: config.priority_burst_limits,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn route_of(&self, metadata: &RequestMetadata) -> String {
        match &self.key_builder {
            Some(build) => build(metadata),
            None => request::route_key(metadata),
        }
    }

    fn route_for_model(&self, metadata: &RequestMetadata, model: &str) -> String {
        match &self.key_builder {
            Some(build) => {
                let mut candidate = metadata.clone();
                candidate.model = Some(model.to_string());
                build(&candidate)
            }
            None => request::route_key_for_model(metadata, model),
        }
    }

    /// Enqueue an erased job and signal the dispatcher.
    pub fn submit(self: Arc<Self>, job: Job) {
        let priority = job.metadata.priority.unwrap_or_default();
        {
            let mut state = self.lock();
            let now = self.clock.now_millis();
            let id = state.next_id;
            state.next_id += 1;

            let wait_deadline =
                job.max_queue_wait.map(|wait| now + wait.as_millis() as u64);
            let deadline_at = match (job.deadline_hint, wait_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            if let Some(deadline) = deadline_at {
                state.deadlines.insert(id, deadline);
            }

            emit_best_effort(
                &self.sink,
                TrafficEvent::Enqueued {
                    route: self.route_of(&job.metadata),
                    priority,
                    attempt: 1,
                },
            );
            state.queues[priority.index()].push_back(QueuedJob {
                id,
                job,
                attempt: 1,
                enqueued_at: now,
                deadline_at,
                queue_timeout_disabled: false,
            });
        }
        self.schedule_drain();
    }

    /// Re-enqueue a retry at its original priority. Retries are exempt from
    /// queue-wait deadlines; those bound time-to-first-dispatch.
    fn re_enqueue(self: Arc<Self>, job: Job, priority: Priority, attempt: u32) {
        {
            let mut state = self.lock();
            let now = self.clock.now_millis();
            let id = state.next_id;
            state.next_id += 1;
            emit_best_effort(
                &self.sink,
                TrafficEvent::Enqueued {
                    route: self.route_of(&job.metadata),
                    priority,
                    attempt,
                },
            );
            state.queues[priority.index()].push_back(QueuedJob {
                id,
                job,
                attempt,
                enqueued_at: now,
                deadline_at: None,
                queue_timeout_disabled: true,
            });
        }
        self.schedule_drain();
    }

    /// Signal the dispatcher without blocking the caller.
    pub fn schedule_drain(self: Arc<Self>) {
        tokio::spawn(async move {
            self.drain();
        });
    }

    /// Run dispatch passes until nothing more is runnable, launching each
    /// selected job on its own task.
    fn drain(self: Arc<Self>) {
        let mut wake_target: Option<u64> = None;

        loop {
            let (result, suppression_active) = {
                let mut state = self.lock();
                let suppressed = self.suppression(&state.streaks);
                let active = suppressed.iter().any(|&s| s);
                let result = self.drain_pass(&mut state, suppressed);
                if let Some((_, priority, _)) = &result.launch {
                    let index = priority.index();
                    for (i, streak) in state.streaks.iter_mut().enumerate() {
                        *streak = if i == index { *streak + 1 } else { 0 };
                    }
                }
                (result, active)
            };
            merge_wake(&mut wake_target, result.wake_at);

            if let Some((id, _, fut)) = result.launch {
                let inner = Arc::clone(&self);
                tokio::spawn(async move {
                    let outcome = fut.await;
                    inner.complete(id, outcome);
                });
                continue;
            }
            if result.rescan {
                continue;
            }
            if suppression_active {
                // Burst suppression may have been the only reason nothing
                // ran; give the suppressed priorities one clean pass.
                self.lock().streaks = [0; 3];
                continue;
            }
            break;
        }

        self.program_wakeup(wake_target);
    }

    fn suppression(&self, streaks: &[u32; 3]) -> [bool; 3] {
        let mut suppressed = [false; 3];
        for priority in Priority::ALL {
            if let Some(&limit) = self.burst_limits.get(&priority) {
                suppressed[priority.index()] = streaks[priority.index()] >= limit;
            }
        }
        suppressed
    }

    /// One dispatch pass over the queues. Selects at most one runnable head.
    fn drain_pass(&self, state: &mut CoreState, suppressed: [bool; 3]) -> PassResult {
        let now = self.clock.now_millis();
        let mut result = PassResult { launch: None, wake_at: None, rescan: false };

        self.sweep_deadlines(state, now);
        merge_wake(&mut result.wake_at, state.deadlines.peek());

        if state.concurrency.global_saturated() {
            return result;
        }

        for priority in Priority::ALL {
            if suppressed[priority.index()] {
                continue;
            }
            match self.evaluate_head(state, priority, &mut result.wake_at) {
                HeadOutcome::Empty | HeadOutcome::Waiting => continue,
                HeadOutcome::Rejected => {
                    result.rescan = true;
                    return result;
                }
                HeadOutcome::Selected => {
                    result.launch = self
                        .launch_head(state, priority, now)
                        .map(|(id, fut)| (id, priority, fut));
                    return result;
                }
            }
        }
        result
    }

    fn sweep_deadlines(&self, state: &mut CoreState, now: u64) {
        for id in state.deadlines.expired(now) {
            for queue in state.queues.iter_mut() {
                let Some(position) = queue.iter().position(|q| q.id == id) else {
                    continue;
                };
                let queued = queue.remove(position).expect("position just found");
                if queued.queue_timeout_disabled {
                    // Deadline raced a retry; put it back untimed.
                    queue.insert(position, queued);
                    break;
                }
                let waited = now.saturating_sub(queued.enqueued_at);
                emit_best_effort(
                    &self.sink,
                    TrafficEvent::QueueTimeout {
                        route: self.route_of(&queued.job.metadata),
                        waited_ms: waited,
                    },
                );
                let max_queue_wait = queued.job.max_queue_wait;
                let deadline_at = queued.deadline_at.unwrap_or(now);
                queued.job.reject(DispatchError::QueueWaitTimeout {
                    waited: Duration::from_millis(waited),
                    max_queue_wait,
                    deadline_at,
                });
                break;
            }
        }
    }

    /// Walk one priority's head through concurrency, circuit (with fallback
    /// navigation), adaptive, and rate-limit checks.
    fn evaluate_head(
        &self,
        state: &mut CoreState,
        priority: Priority,
        wake_at: &mut Option<u64>,
    ) -> HeadOutcome {
        let index = priority.index();
        let mut visited: HashSet<String> = HashSet::new();

        loop {
            let Some(head) = state.queues[index].front_mut() else {
                return HeadOutcome::Empty;
            };
            let route = match &self.key_builder {
                Some(build) => build(&head.job.metadata),
                None => request::route_key(&head.job.metadata),
            };

            match state.concurrency.check(&head.job.metadata, &route) {
                ConcurrencyDecision::Allow(_) => {}
                ConcurrencyDecision::Wait(reasons) => {
                    tracing::trace!(route, ?reasons, "head waiting on concurrency");
                    return HeadOutcome::Waiting;
                }
            }

            match state.circuits.admit(&route) {
                CircuitDecision::Allow { .. } => {}
                CircuitDecision::Open { retry_after_ms } => {
                    let origin = head
                        .job
                        .metadata
                        .model
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string());
                    visited.insert(origin.clone());

                    if self.replace_with_fallback(state, index, &origin, &mut visited) {
                        // Replacement installed; re-run the whole gauntlet.
                        continue;
                    }

                    let rejected = state.queues[index]
                        .pop_front()
                        .expect("head still present");
                    state.deadlines.invalidate(rejected.id);
                    emit_best_effort(
                        &self.sink,
                        TrafficEvent::Failed {
                            route: route.clone(),
                            tenant: rejected.job.tenant.clone(),
                            terminal: true,
                        },
                    );
                    rejected.job.reject(DispatchError::CircuitOpen {
                        route,
                        retry_after: Some(Duration::from_millis(retry_after_ms)),
                    });
                    return HeadOutcome::Rejected;
                }
            }

            let adaptive_key = AdaptiveLimiter::key(&route, &head.job.tenant);
            if let Resolution::Wait { wake_up_at } = state.adaptive.resolve(&adaptive_key) {
                merge_wake(wake_at, wake_up_at);
                return HeadOutcome::Waiting;
            }

            match state.coordinator.resolve(&route, head.job.estimated_tokens) {
                Resolution::Proceed => return HeadOutcome::Selected,
                Resolution::Wait { wake_up_at } => {
                    merge_wake(wake_at, wake_up_at);
                    return HeadOutcome::Waiting;
                }
                Resolution::Blocked => return HeadOutcome::Waiting,
                Resolution::Skip => {
                    let dropped = state.queues[index]
                        .pop_front()
                        .expect("head still present");
                    state.deadlines.invalidate(dropped.id);
                    return HeadOutcome::Rejected;
                }
            }
        }
    }

    /// Walk the origin model's fallback chain; on the first candidate whose
    /// circuit allows entry and whose factory produces a replacement, swap it
    /// in at the head. Returns whether a replacement was installed.
    fn replace_with_fallback(
        &self,
        state: &mut CoreState,
        queue_index: usize,
        origin: &str,
        visited: &mut HashSet<String>,
    ) -> bool {
        let chain: Vec<String> = match state.circuits.fallback_chain(origin) {
            Some(chain) => chain.to_vec(),
            None => return false,
        };
        let Some(head) = state.queues[queue_index].front_mut() else {
            return false;
        };
        if !head.job.has_fallback() {
            return false;
        }

        for candidate in chain {
            if !visited.insert(candidate.clone()) {
                continue;
            }
            let candidate_route = self.route_for_model(&head.job.metadata, &candidate);
            if matches!(
                state.circuits.admit(&candidate_route),
                CircuitDecision::Open { .. }
            ) {
                continue;
            }
            match head.job.fallback(&candidate) {
                Some(replacement) => {
                    emit_best_effort(
                        &self.sink,
                        TrafficEvent::FallbackSelected {
                            from: origin.to_string(),
                            to: candidate.clone(),
                        },
                    );
                    // Fresh request: attempt count and reservations reset.
                    head.job = replacement;
                    head.attempt = 1;
                    return true;
                }
                None => continue,
            }
        }
        false
    }

    /// Pop the selected head, take its slots, and produce its run future.
    fn launch_head(
        &self,
        state: &mut CoreState,
        priority: Priority,
        now: u64,
    ) -> Option<(u64, BoxFuture<'static, RunOutcome>)> {
        let mut queued = state.queues[priority.index()].pop_front()?;
        state.deadlines.invalidate(queued.id);

        let route = self.route_of(&queued.job.metadata);
        let gates = match state.concurrency.check(&queued.job.metadata, &route) {
            ConcurrencyDecision::Allow(keys) => keys,
            // Unreachable in a single pass; fail closed by requeueing.
            ConcurrencyDecision::Wait(_) => {
                state.queues[priority.index()].push_front(queued);
                return None;
            }
        };
        state.concurrency.acquire(&gates);
        if let CircuitDecision::Allow { trial: true } = state.circuits.admit(&route) {
            state.circuits.mark_trial(&route);
        }
        state.coordinator.on_dispatch(&route);
        let reserved_tokens =
            state.coordinator.reservation_for(&route, queued.job.estimated_tokens);

        emit_best_effort(
            &self.sink,
            TrafficEvent::Dispatched {
                route: route.clone(),
                priority,
                attempt: queued.attempt,
                queued_ms: now.saturating_sub(queued.enqueued_at),
            },
        );

        let future = queued.job.run();
        state.in_flight.insert(
            queued.id,
            InFlight {
                job: queued.job,
                priority,
                attempt: queued.attempt,
                route,
                gates,
                reserved_tokens,
            },
        );
        Some((queued.id, future))
    }

    /// Completion path: release slots and reservations, feed the circuit,
    /// adaptive, and usage trackers, then retry or settle.
    fn complete(self: Arc<Self>, id: u64, outcome: RunOutcome) {
        let mut retry: Option<(Job, Priority, u32, Duration)> = None;
        let mut wake_target: Option<u64> = None;

        {
            let mut state = self.lock();
            let Some(infl) = state.in_flight.remove(&id) else {
                tracing::warn!(id, "completion for unknown dispatch");
                return;
            };
            state.concurrency.release(&infl.gates);
            let adaptive_key = AdaptiveLimiter::key(&infl.route, &infl.job.tenant);

            match outcome {
                RunOutcome::Delivered { usage } => {
                    let reconcile = usage.unwrap_or(TokenUsage {
                        input_tokens: None,
                        output_tokens: None,
                        // No extractor: settle the reservation at its estimate.
                        total_tokens: infl.reserved_tokens,
                    });
                    let wake = state.coordinator.record_usage(
                        &infl.route,
                        &reconcile,
                        infl.reserved_tokens,
                    );
                    merge_wake(&mut wake_target, wake);
                    state.coordinator.on_complete(&infl.route, None);

                    if state.circuits.record_success(&infl.route) {
                        emit_best_effort(
                            &self.sink,
                            TrafficEvent::CircuitClosed { route: infl.route.clone() },
                        );
                    }
                    state.adaptive.record_success(&adaptive_key);
                    if let Some(usage) = usage {
                        state.usage.record(&infl.job.tenant, &usage);
                    }
                    emit_best_effort(
                        &self.sink,
                        TrafficEvent::Succeeded {
                            route: infl.route.clone(),
                            tenant: infl.job.tenant.clone(),
                        },
                    );
                }
                RunOutcome::Failed(error) => {
                    let error = enrich_rate_limited(error, &infl.job.tenant, &infl.route);
                    state.coordinator.on_complete(&infl.route, infl.reserved_tokens);

                    let kind = FailureKind::from_error(&error);
                    if state.circuits.record_failure(&infl.route, kind) {
                        emit_best_effort(
                            &self.sink,
                            TrafficEvent::CircuitOpened { route: infl.route.clone() },
                        );
                    }
                    if error.is_rate_limited() {
                        state.adaptive.record_429(&adaptive_key, error.retry_after());
                    }

                    let plan = state.planner.plan(
                        &error,
                        infl.attempt,
                        &infl.route,
                        infl.job.metadata.provider.as_deref(),
                        infl.job.metadata.model.as_deref(),
                    );
                    match plan {
                        Some(plan) => {
                            emit_best_effort(
                                &self.sink,
                                TrafficEvent::RetryScheduled {
                                    route: infl.route.clone(),
                                    reason: plan.reason,
                                    delay: plan.delay,
                                    next_attempt: infl.attempt + 1,
                                },
                            );
                            retry =
                                Some((infl.job, infl.priority, infl.attempt + 1, plan.delay));
                        }
                        None => {
                            emit_best_effort(
                                &self.sink,
                                TrafficEvent::Failed {
                                    route: infl.route.clone(),
                                    tenant: infl.job.tenant.clone(),
                                    terminal: true,
                                },
                            );
                            infl.job.reject(DispatchError::Upstream(error));
                        }
                    }
                }
            }
        }

        Arc::clone(&self).program_wakeup(wake_target);
        if let Some((job, priority, attempt, delay)) = retry {
            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                inner.sleeper.sleep(delay).await;
                inner.re_enqueue(job, priority, attempt);
            });
        }
        self.drain();
    }

    /// Program the single wakeup timer, reprogramming only for a strictly
    /// sooner deadline.
    fn program_wakeup(self: Arc<Self>, at: Option<u64>) {
        let Some(at) = at else { return };
        let mut state = self.lock();

        if let Some(current) = state.wakeup.at {
            if current <= at {
                return;
            }
        }
        if let Some(handle) = state.wakeup.handle.take() {
            handle.abort();
        }
        state.wakeup.at = Some(at);

        let now = self.clock.now_millis();
        let delay = Duration::from_millis(at.saturating_sub(now).max(1));
        let weak = Arc::downgrade(&self);
        let sleeper = self.sleeper.clone();
        state.wakeup.handle = Some(tokio::spawn(async move {
            sleeper.sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            {
                let mut state = inner.lock();
                state.wakeup.at = None;
                state.wakeup.handle = None;
            }
            inner.drain();
        }));
    }

    /// Ingest provider headers for a route and poke the dispatcher.
    pub fn update_from_headers(
        self: Arc<Self>,
        metadata: &RequestMetadata,
        headers: &Headers,
    ) -> Option<RateLimitUpdate> {
        let route = self.route_of(metadata);
        let update = {
            let mut state = self.lock();
            state.coordinator.update_from_headers(&route, headers)
        };
        if update.is_some() {
            self.schedule_drain();
        }
        update
    }

    /// A stream failed after it started; feed the circuit and adaptive
    /// limiters as if the dispatch itself had failed.
    pub fn report_stream_failure(
        self: Arc<Self>,
        metadata: &RequestMetadata,
        error: &UpstreamError,
    ) {
        let route = self.route_of(metadata);
        {
            let mut state = self.lock();
            let kind = FailureKind::from_error(error);
            if state.circuits.record_failure(&route, kind) {
                emit_best_effort(
                    &self.sink,
                    TrafficEvent::CircuitOpened { route: route.clone() },
                );
            }
            if error.is_rate_limited() {
                if let Some(tenant) = metadata.tenant_id.as_deref() {
                    let key = AdaptiveLimiter::key(&route, tenant);
                    state.adaptive.record_429(&key, error.retry_after());
                }
            }
        }
        emit_best_effort(&self.sink, TrafficEvent::StreamFailureReported { route });
        self.schedule_drain();
    }

    pub fn tenant_usage(&self, tenant: &str) -> Option<TenantUsage> {
        self.lock().usage.snapshot(tenant)
    }

    pub fn circuit_status(&self, metadata: &RequestMetadata) -> CircuitStatus {
        let route = self.route_of(metadata);
        self.lock().circuits.status(&route)
    }
}

enum HeadOutcome {
    Empty,
    Waiting,
    Selected,
    Rejected,
}

fn enrich_rate_limited(error: UpstreamError, tenant: &str, route: &str) -> UpstreamError {
    match error {
        UpstreamError::RateLimited { retry_after, tenant: t, key } => {
            UpstreamError::RateLimited {
                retry_after,
                tenant: t.or_else(|| Some(tenant.to_string())),
                key: key.or_else(|| Some(route.to_string())),
            }
        }
        other => other,
    }
}
