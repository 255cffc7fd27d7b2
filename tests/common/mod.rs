//! Shared helpers for the scheduling scenario tests.
//!
//! Tests run on a paused tokio clock, so every duration below is virtual
//! time: deterministic and instant in wall-clock terms.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchyard::{DispatchRequest, Priority, TokenUsage, UpstreamError};

/// Dispatch log: `(label, virtual ms since test start)` per executed request.
pub type Log = Arc<Mutex<Vec<(String, u64)>>>;

pub fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(log: &Log) -> Vec<(String, u64)> {
    log.lock().unwrap().clone()
}

pub fn labels(log: &Log) -> Vec<String> {
    entries(log).into_iter().map(|(label, _)| label).collect()
}

/// A request that records its execution into `log` and succeeds after
/// `work_ms` of virtual time.
pub fn tracked_request(
    label: &str,
    provider: &str,
    model: &str,
    priority: Priority,
    work_ms: u64,
    log: &Log,
    started: tokio::time::Instant,
) -> DispatchRequest<String> {
    let label = label.to_string();
    let log = log.clone();
    DispatchRequest::builder()
        .tenant("tenant-a")
        .provider(provider)
        .model(model)
        .priority(priority)
        .execute(move || {
            let label = label.clone();
            let log = log.clone();
            async move {
                log.lock()
                    .unwrap()
                    .push((label.clone(), started.elapsed().as_millis() as u64));
                tokio::time::sleep(Duration::from_millis(work_ms)).await;
                Ok(label)
            }
        })
        .build()
        .expect("valid request")
}

/// A request that always succeeds with fixed token usage.
pub fn usage_request(
    tenant: &str,
    provider: &str,
    model: &str,
    total_tokens: u64,
    estimated: u64,
    log: &Log,
    started: tokio::time::Instant,
) -> DispatchRequest<String> {
    let log = log.clone();
    let label = format!("{provider}::{model}");
    DispatchRequest::builder()
        .tenant(tenant)
        .provider(provider)
        .model(model)
        .estimated_tokens(estimated)
        .execute(move || {
            let label = label.clone();
            let log = log.clone();
            async move {
                log.lock()
                    .unwrap()
                    .push((label.clone(), started.elapsed().as_millis() as u64));
                Ok(label)
            }
        })
        .usage(move |_| {
            Some(TokenUsage { total_tokens: Some(total_tokens), ..Default::default() })
        })
        .build()
        .expect("valid request")
}

/// A request that fails `failures` times with `error()` and then succeeds.
pub fn flaky_request(
    failures: u32,
    error: impl Fn() -> UpstreamError + Send + Sync + 'static,
    log: &Log,
    started: tokio::time::Instant,
) -> DispatchRequest<String> {
    let log = log.clone();
    let attempts = Arc::new(Mutex::new(0u32));
    DispatchRequest::builder()
        .tenant("tenant-a")
        .provider("p")
        .model("m")
        .execute(move || {
            let log = log.clone();
            let attempts = attempts.clone();
            let n = {
                let mut guard = attempts.lock().unwrap();
                *guard += 1;
                *guard
            };
            let err = (n <= failures).then(|| error());
            async move {
                log.lock()
                    .unwrap()
                    .push((format!("attempt-{n}"), started.elapsed().as_millis() as u64));
                match err {
                    Some(err) => Err(err),
                    None => Ok("done".to_string()),
                }
            }
        })
        .build()
        .expect("valid request")
}
