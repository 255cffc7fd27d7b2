//! Circuit breaking with fallback-chain navigation.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use switchyard::{
    CircuitStatus, DispatchRequest, RequestMetadata, TrafficConfig, TrafficController,
    UpstreamError,
};

fn metadata_for(model: &str) -> RequestMetadata {
    RequestMetadata {
        provider: Some("p".into()),
        model: Some(model.into()),
        tenant_id: Some("tenant-a".into()),
        ..Default::default()
    }
}

/// Trip a route's circuit through reported stream failures.
fn trip(controller: &TrafficController, model: &str) {
    let metadata = metadata_for(model);
    for _ in 0..5 {
        controller
            .report_stream_failure(&metadata, &UpstreamError::from_status(500, None));
    }
    assert_eq!(controller.circuit_status(&metadata), CircuitStatus::Open);
}

/// A request targeting `origin` whose fallback factory builds an equivalent
/// request for whichever model the controller nominates.
fn request_with_fallback(
    origin: &str,
    executed: Arc<Mutex<Vec<String>>>,
) -> DispatchRequest<String> {
    fn build(model: String, executed: Arc<Mutex<Vec<String>>>) -> DispatchRequest<String> {
        let exec_model = model.clone();
        let exec_log = executed.clone();
        DispatchRequest::builder()
            .tenant("tenant-a")
            .provider("p")
            .model(model)
            .execute(move || {
                let model = exec_model.clone();
                let log = exec_log.clone();
                async move {
                    log.lock().unwrap().push(model.clone());
                    Ok(model)
                }
            })
            .fallback(move |target| Some(build(target.to_string(), executed.clone())))
            .build()
            .unwrap()
    }
    build(origin.to_string(), executed)
}

#[tokio::test(start_paused = true)]
async fn fallback_walk_skips_open_circuits_and_never_loops() {
    let mut chains = HashMap::new();
    chains.insert("A".to_string(), vec!["B".to_string(), "C".to_string()]);
    chains.insert("B".to_string(), vec!["A".to_string()]);
    let controller = TrafficController::new(TrafficConfig {
        fallback_chains: chains,
        ..Default::default()
    });

    trip(&controller, "A");
    trip(&controller, "B");

    let executed = Arc::new(Mutex::new(Vec::new()));
    let result = controller
        .handle_text(request_with_fallback("A", executed.clone()))
        .await
        .unwrap();

    assert_eq!(result, "C");
    // Exactly one execution, on C; A and B never ran.
    assert_eq!(*executed.lock().unwrap(), vec!["C".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_chain_rejects_with_circuit_open() {
    let mut chains = HashMap::new();
    chains.insert("A".to_string(), vec!["B".to_string()]);
    let controller = TrafficController::new(TrafficConfig {
        fallback_chains: chains,
        ..Default::default()
    });

    trip(&controller, "A");
    trip(&controller, "B");

    let executed = Arc::new(Mutex::new(Vec::new()));
    let error = controller
        .handle_text(request_with_fallback("A", executed.clone()))
        .await
        .unwrap_err();

    match &error {
        switchyard::DispatchError::CircuitOpen { retry_after, .. } => {
            assert!(retry_after.is_some());
        }
        other => panic!("expected circuit-open, got {:?}", other),
    }
    assert!(executed.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn open_circuit_without_factory_rejects_immediately() {
    let controller = TrafficController::new(TrafficConfig::default());
    trip(&controller, "A");

    let request = DispatchRequest::<String>::builder()
        .tenant("tenant-a")
        .provider("p")
        .model("A")
        .execute(|| async { Ok("unreachable".to_string()) })
        .build()
        .unwrap();

    let error = controller.handle_text(request).await.unwrap_err();
    assert!(error.is_circuit_open());
}

#[tokio::test(start_paused = true)]
async fn declined_factory_skips_to_the_next_candidate() {
    let mut chains = HashMap::new();
    chains.insert("A".to_string(), vec!["B".to_string(), "C".to_string()]);
    let controller = TrafficController::new(TrafficConfig {
        fallback_chains: chains,
        ..Default::default()
    });
    trip(&controller, "A");

    let executed = Arc::new(Mutex::new(Vec::new()));
    let exec_log = executed.clone();
    let request = DispatchRequest::builder()
        .tenant("tenant-a")
        .provider("p")
        .model("A")
        .execute(|| async { Ok("unreachable".to_string()) })
        .fallback(move |target| {
            // Decline B; accept C.
            if target == "B" {
                return None;
            }
            let target = target.to_string();
            let log = exec_log.clone();
            Some(
                DispatchRequest::builder()
                    .tenant("tenant-a")
                    .provider("p")
                    .model(target.clone())
                    .execute(move || {
                        let target = target.clone();
                        let log = log.clone();
                        async move {
                            log.lock().unwrap().push(target.clone());
                            Ok(target)
                        }
                    })
                    .build()
                    .unwrap(),
            )
        })
        .build()
        .unwrap();

    assert_eq!(controller.handle_text(request).await.unwrap(), "C");
    assert_eq!(*executed.lock().unwrap(), vec!["C".to_string()]);
}
