//! Dispatch telemetry.
//!
//! The controller emits structured [`TrafficEvent`]s at every scheduling
//! decision point. Events flow through an [`EventSink`]; a sink that fails
//! (or panics) never affects dispatch.

use crate::request::Priority;
use crate::retry::RetryReason;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scheduling events emitted by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum TrafficEvent {
    Enqueued { route: String, priority: Priority, attempt: u32 },
    Dispatched { route: String, priority: Priority, attempt: u32, queued_ms: u64 },
    Succeeded { route: String, tenant: String },
    Failed { route: String, tenant: String, terminal: bool },
    RetryScheduled { route: String, reason: RetryReason, delay: Duration, next_attempt: u32 },
    QueueTimeout { route: String, waited_ms: u64 },
    CircuitOpened { route: String },
    CircuitClosed { route: String },
    FallbackSelected { from: String, to: String },
    StreamFailureReported { route: String },
}

/// Consumer of traffic events.
pub trait EventSink: Send + Sync + std::fmt::Debug {
    fn emit(&self, event: &TrafficEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &TrafficEvent) {}
}

/// Logs events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &TrafficEvent) {
        match event {
            TrafficEvent::Failed { .. }
            | TrafficEvent::QueueTimeout { .. }
            | TrafficEvent::CircuitOpened { .. }
            | TrafficEvent::StreamFailureReported { .. } => {
                tracing::warn!(?event, "traffic_event");
            }
            _ => tracing::debug!(?event, "traffic_event"),
        }
    }
}

/// Buffers events in memory; the assertion surface for integration tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<TrafficEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TrafficEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &TrafficEvent) {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).push(event.clone());
    }
}

/// Emit through a panic barrier so a broken sink cannot take down dispatch.
pub(crate) fn emit_best_effort(sink: &Arc<dyn EventSink>, event: TrafficEvent) {
    if catch_unwind(AssertUnwindSafe(|| sink.emit(&event))).is_err() {
        tracing::warn!("event sink panicked; event dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct PanickySink;

    impl EventSink for PanickySink {
        fn emit(&self, _event: &TrafficEvent) {
            panic!("sink exploded");
        }
    }

    #[test]
    fn memory_sink_records_in_order() {
        let sink = MemorySink::new();
        sink.emit(&TrafficEvent::CircuitOpened { route: "p::m".into() });
        sink.emit(&TrafficEvent::CircuitClosed { route: "p::m".into() });
        assert_eq!(
            sink.events(),
            vec![
                TrafficEvent::CircuitOpened { route: "p::m".into() },
                TrafficEvent::CircuitClosed { route: "p::m".into() },
            ]
        );
    }

    #[test]
    fn panicking_sink_is_contained() {
        let sink: Arc<dyn EventSink> = Arc::new(PanickySink);
        emit_best_effort(&sink, TrafficEvent::CircuitOpened { route: "p::m".into() });
        // Still here: the panic did not propagate.
    }
}
