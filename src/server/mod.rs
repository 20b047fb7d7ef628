//! HTTP server for health and metrics endpoints
//!
//! Probes and Prometheus scraping live in `health`; counters in `metrics`;
//! SIGTERM/SIGINT handling in `shutdown`.

mod health;
pub mod metrics;
pub mod shutdown;

pub use health::{run_health_server, Phase, ReadinessState};
pub use metrics::{create_metrics, ControllerMetrics, LifecycleEvent, SharedMetrics};
pub use shutdown::{
    shutdown_channel, wait_for_signal, ShutdownController, ShutdownSignal, TerminationSignal,
};

#[cfg(test)]
#[path = "health_test.rs"]
mod health_tests;

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;
