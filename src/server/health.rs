//! Probe and scrape endpoints served next to the Trial controller
//!
//! `/healthz` answers for as long as the process runs. `/readyz` turns green
//! once workload kinds are resolved and the controller stream starts, and drops
//! back to 503 while draining. `/metrics` exposes the Prometheus registry.

use crate::server::metrics::SharedMetrics;
use crate::server::shutdown::ShutdownSignal;
use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Lifecycle phase reported by the readiness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Serving,
    Draining,
}

impl Phase {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Phase::Serving,
            2 => Phase::Draining,
            _ => Phase::Starting,
        }
    }

    fn as_raw(self) -> u8 {
        match self {
            Phase::Starting => 0,
            Phase::Serving => 1,
            Phase::Draining => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Starting => "starting",
            Phase::Serving => "serving",
            Phase::Draining => "draining",
        }
    }
}

/// Readiness shared between `main` and the probe handler
#[derive(Debug, Clone, Default)]
pub struct ReadinessState {
    phase: Arc<AtomicU8>,
    workload_kinds: Arc<AtomicUsize>,
}

impl ReadinessState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The controller stream is starting with `workload_kinds` owned kinds watched
    pub fn set_ready(&self, workload_kinds: usize) {
        self.workload_kinds.store(workload_kinds, Ordering::SeqCst);
        self.phase.store(Phase::Serving.as_raw(), Ordering::SeqCst);
    }

    /// Stop advertising readiness while the process drains
    pub fn set_not_ready(&self) {
        self.phase.store(Phase::Draining.as_raw(), Ordering::SeqCst);
    }

    pub fn phase(&self) -> Phase {
        Phase::from_raw(self.phase.load(Ordering::SeqCst))
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == Phase::Serving
    }

    pub fn workload_kinds(&self) -> usize {
        self.workload_kinds.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct ProbeState {
    readiness: ReadinessState,
    metrics: SharedMetrics,
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<ProbeState>) -> (StatusCode, String) {
    let phase = state.readiness.phase();
    match phase {
        Phase::Serving => (
            StatusCode::OK,
            format!(
                "{}: {} workload kinds",
                phase.as_str(),
                state.readiness.workload_kinds()
            ),
        ),
        _ => (StatusCode::SERVICE_UNAVAILABLE, phase.as_str().to_string()),
    }
}

async fn scrape(State(state): State<ProbeState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (StatusCode::OK, [(CONTENT_TYPE, PROMETHEUS_TEXT)], body).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

fn build_router(readiness: ReadinessState, metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(scrape))
        .with_state(ProbeState { readiness, metrics })
}

/// Serve probes and metrics on `0.0.0.0:port` until `shutdown` fires
///
/// In-flight scrapes are allowed to finish before the listener closes.
pub async fn run_health_server(
    port: u16,
    readiness: ReadinessState,
    metrics: SharedMetrics,
    shutdown: ShutdownSignal,
) -> Result<(), std::io::Error> {
    let app = build_router(readiness, metrics);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, "Health and metrics server listening");

    let mut shutdown = shutdown;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;

    info!("Health and metrics server stopped");
    Ok(())
}
