//! Retry scheduling through the dispatcher.

mod common;

use common::{entries, flaky_request, new_log};
use std::sync::Arc;
use std::time::Duration;
use switchyard::{
    MemorySink, RetryReason, TrafficConfig, TrafficController, TrafficEvent, UpstreamError,
};

fn controller_with_sink() -> (TrafficController, MemorySink) {
    let sink = MemorySink::new();
    let controller = TrafficController::new(TrafficConfig {
        sink: Some(Arc::new(sink.clone())),
        ..Default::default()
    });
    (controller, sink)
}

/// A 429 with `retry-after: 2` must not be retried sooner than two seconds.
#[tokio::test(start_paused = true)]
async fn retry_after_floor_is_honored() {
    let (controller, sink) = controller_with_sink();
    let started = tokio::time::Instant::now();
    let log = new_log();

    let request = flaky_request(
        1,
        || UpstreamError::from_status(429, Some(Duration::from_secs(2))),
        &log,
        started,
    );
    let result = controller.handle_text(request).await.unwrap();
    assert_eq!(result, "done");

    let attempts = entries(&log);
    assert_eq!(attempts.len(), 2);
    assert!(attempts[0].1 < 100, "first attempt immediate");
    assert!(
        attempts[1].1 >= 2_000,
        "second attempt at {}ms, expected >= 2000",
        attempts[1].1
    );

    let plan = sink
        .events()
        .into_iter()
        .find_map(|event| match event {
            TrafficEvent::RetryScheduled { reason, delay, next_attempt, .. } => {
                Some((reason, delay, next_attempt))
            }
            _ => None,
        })
        .expect("a retry was scheduled");
    assert_eq!(plan.0, RetryReason::RateLimit);
    assert!(plan.1 >= Duration::from_secs(2));
    assert_eq!(plan.2, 2);
}

#[tokio::test(start_paused = true)]
async fn server_errors_retry_until_the_budget_is_spent() {
    let (controller, _sink) = controller_with_sink();
    let started = tokio::time::Instant::now();
    let log = new_log();

    // Fails more times than the budget allows; surfaces the last error.
    let request =
        flaky_request(10, || UpstreamError::from_status(503, None), &log, started);
    let error = controller.handle_text(request).await.unwrap_err();

    assert_eq!(
        error.as_upstream().and_then(UpstreamError::status),
        Some(503)
    );
    assert_eq!(entries(&log).len(), 3, "MAX_RETRY_ATTEMPTS bounds total attempts");
}

#[tokio::test(start_paused = true)]
async fn timeouts_get_the_stricter_budget() {
    let (controller, _sink) = controller_with_sink();
    let started = tokio::time::Instant::now();
    let log = new_log();

    let request =
        flaky_request(10, || UpstreamError::Timeout { elapsed: None }, &log, started);
    let result = controller.handle_text(request).await;

    assert!(result.is_err());
    assert_eq!(entries(&log).len(), 2, "TIMEOUT_RETRY_ATTEMPTS bounds total attempts");
}

#[tokio::test(start_paused = true)]
async fn ineligible_errors_are_not_retried() {
    let (controller, _sink) = controller_with_sink();
    let started = tokio::time::Instant::now();
    let log = new_log();

    let request = flaky_request(10, || UpstreamError::from_status(400, None), &log, started);
    let error = controller.handle_text(request).await.unwrap_err();

    assert_eq!(error.as_upstream().and_then(UpstreamError::status), Some(400));
    assert_eq!(entries(&log).len(), 1, "no retry for client errors");
}

/// Repeated 429 clusters impose an adaptive cooldown over and above the
/// provider's own pacing.
#[tokio::test(start_paused = true)]
async fn clustered_429s_impose_an_adaptive_cooldown() {
    let (controller, _sink) = controller_with_sink();
    let started = tokio::time::Instant::now();
    let log = new_log();

    // Two 429s from the first submission's retries, a third from the second
    // submission: the cluster crosses the adaptive threshold.
    let first = flaky_request(2, || UpstreamError::from_status(429, None), &log, started);
    controller.handle_text(first).await.unwrap();

    let second = flaky_request(1, || UpstreamError::from_status(429, None), &log, started);
    controller.handle_text(second).await.unwrap();

    let attempts = entries(&log);
    assert_eq!(attempts.len(), 5);
    // The third 429 tripped the cooldown, so the final attempt waits out at
    // least the minimum penalty.
    let gap = attempts[4].1 - attempts[3].1;
    assert!(gap >= 1_000, "cooldown gap was {gap}ms");
}
