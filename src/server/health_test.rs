//! Tests for probe and metrics endpoints

use super::*;
use crate::server::metrics::{create_metrics, LifecycleEvent};
use crate::server::shutdown::{shutdown_channel, ShutdownController};
use std::time::Duration;

/// Spawn the server and poll `/healthz` until it answers
async fn start_server(
    port: u16,
    readiness: ReadinessState,
    metrics: SharedMetrics,
) -> (
    reqwest::Client,
    ShutdownController,
    tokio::task::JoinHandle<Result<(), std::io::Error>>,
) {
    let (controller, signal) = shutdown_channel();
    let handle =
        tokio::spawn(async move { run_health_server(port, readiness, metrics, signal).await });

    let client = reqwest::Client::new();
    let mut delay = Duration::from_millis(10);
    for attempt in 1..=10 {
        let probe = client
            .get(format!("http://127.0.0.1:{}/healthz", port))
            .timeout(Duration::from_millis(100))
            .send()
            .await;
        match probe {
            Ok(_) => break,
            Err(e) if attempt == 10 => panic!("server on port {} never answered: {}", port, e),
            Err(_) => {
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_millis(200));
            }
        }
    }
    (client, controller, handle)
}

async fn get(client: &reqwest::Client, port: u16, path: &str) -> reqwest::Response {
    client
        .get(format!("http://127.0.0.1:{}{}", port, path))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("request to health server failed")
}

#[tokio::test]
async fn test_healthz_answers_while_starting() {
    let port = 18080;
    let (client, controller, handle) =
        start_server(port, ReadinessState::new(), create_metrics().unwrap()).await;

    assert_eq!(get(&client, port, "/healthz").await.status(), 200);

    controller.shutdown();
    let _ = handle.await;
}

#[tokio::test]
async fn test_readyz_is_503_until_controller_starts() {
    let port = 18081;
    let readiness = ReadinessState::new();
    let (client, controller, handle) =
        start_server(port, readiness.clone(), create_metrics().unwrap()).await;

    let response = get(&client, port, "/readyz").await;
    assert_eq!(response.status(), 503);
    assert_eq!(response.text().await.unwrap(), "starting");

    readiness.set_ready(2);
    let response = get(&client, port, "/readyz").await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "serving: 2 workload kinds");

    controller.shutdown();
    let _ = handle.await;
}

#[tokio::test]
async fn test_readyz_is_503_while_draining() {
    let port = 18082;
    let readiness = ReadinessState::new();
    readiness.set_ready(1);
    let (client, controller, handle) =
        start_server(port, readiness.clone(), create_metrics().unwrap()).await;

    readiness.set_not_ready();
    let response = get(&client, port, "/readyz").await;
    assert_eq!(response.status(), 503);
    assert_eq!(response.text().await.unwrap(), "draining");

    controller.shutdown();
    let _ = handle.await;
}

#[tokio::test]
async fn test_metrics_endpoint_serves_trial_counters() {
    let port = 18083;
    let metrics = create_metrics().unwrap();
    metrics.record(LifecycleEvent::Succeeded, "tuning");
    let (client, controller, handle) =
        start_server(port, ReadinessState::new(), metrics.clone()).await;

    let response = get(&client, port, "/metrics").await;
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains(r#"trial_succeeded_total{namespace="tuning"} 1"#));

    controller.shutdown();
    let _ = handle.await;
}

#[tokio::test]
async fn test_server_stops_on_shutdown_request() {
    let port = 18084;
    let (_client, controller, handle) =
        start_server(port, ReadinessState::new(), create_metrics().unwrap()).await;

    controller.shutdown();
    let stopped = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("server should stop after shutdown request")
        .expect("server task panicked");
    assert!(stopped.is_ok());
}

#[test]
fn test_readiness_phases() {
    let state = ReadinessState::new();
    assert_eq!(state.phase(), Phase::Starting);
    assert!(!state.is_ready());

    state.set_ready(3);
    let shared = state.clone();
    assert!(shared.is_ready());
    assert_eq!(shared.workload_kinds(), 3);

    state.set_not_ready();
    assert_eq!(shared.phase(), Phase::Draining);
}
