use futures::StreamExt;
use kube::api::DynamicObject;
use kube::runtime::controller::{self, Controller};
use kube::runtime::watcher;
use kube::{Api, Client};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use trialctl::config::ControllerConfig;
use trialctl::controller::clock::SystemClock;
use trialctl::controller::cluster::KubeClusterClient;
use trialctl::controller::events::KubeEventPublisher;
use trialctl::controller::manager::HttpManagerClient;
use trialctl::controller::registry::WorkloadRegistry;
use trialctl::controller::{error_policy, reconcile, Context};
use trialctl::crd::trial::Trial;
use trialctl::server::{
    create_metrics, run_health_server, shutdown_channel, wait_for_signal, ReadinessState,
};

/// Human-readable watch scope for logs
fn describe_scope(namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) => format!("namespace {}", ns),
        None => "all namespaces".to_string(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting trial controller");

    // reqwest and kube both use rustls; pick the provider once for the process
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = ControllerConfig::from_env()?;
    info!(
        workload_kinds = ?config.workload_kinds.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
        manager = %config.manager_address,
        scope = %describe_scope(config.watch_namespace.as_deref()),
        "Configuration loaded"
    );

    // Create shutdown channel for coordinated shutdown
    let (shutdown_controller, shutdown_signal) = shutdown_channel();

    // Create readiness state (initially not ready)
    let readiness = ReadinessState::new();

    let metrics = create_metrics()?;
    info!("Prometheus metrics registry initialized");

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    // Start health server in background
    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_port = config.health_port;
    let health_shutdown = shutdown_signal.clone();
    let health_handle = tokio::spawn(async move {
        if let Err(e) =
            run_health_server(health_port, health_readiness, health_metrics, health_shutdown).await
        {
            warn!(error = %e, "Health server failed");
        }
    });

    // Resolve workload kinds; uninstalled kinds are skipped
    let registry = WorkloadRegistry::discover(&client, &config.workload_kinds).await?;
    if registry.resources().is_empty() {
        warn!("No configured workload kind is installed; trials cannot start workloads");
    }

    let manager = HttpManagerClient::new(config.manager_address.clone(), config.manager_timeout)?;

    let trials: Api<Trial> = match &config.watch_namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let mut trial_controller = Controller::new(trials, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(config.concurrency));
    for resource in registry.resources() {
        let workloads: Api<DynamicObject> = match &config.watch_namespace {
            Some(ns) => Api::namespaced_with(client.clone(), ns, resource),
            None => Api::all_with(client.clone(), resource),
        };
        trial_controller =
            trial_controller.owns_with(workloads, resource.clone(), watcher::Config::default());
    }

    // Recompute the trial_current gauge from the controller cache
    let store = trial_controller.store();
    let gauge_metrics = metrics.clone();
    let mut gauge_shutdown = shutdown_signal.clone();
    let gauge_refresh = config.gauge_refresh;
    let gauge_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(gauge_refresh);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = store.state();
                    gauge_metrics.set_current_trials(snapshot.iter().map(|t| t.as_ref()));
                }
                _ = gauge_shutdown.wait() => break,
            }
        }
    });

    let registry_size = registry.resources().len();
    let ctx = Arc::new(Context::new(
        Arc::new(KubeClusterClient::new(client.clone())),
        Arc::new(manager),
        Arc::new(KubeEventPublisher::new(client.clone())),
        registry,
        Arc::new(SystemClock),
        Some(metrics.clone()),
    ));

    readiness.set_ready(registry_size);
    info!("Controller ready, starting reconciliation loop");

    // error_policy already logs errors with warn!
    let controller = trial_controller
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(trial = %obj.name, ?action, "Reconciled"),
                Err(e) => debug!(error = %e, "Controller event not reconciled"),
            }
        });

    // Run controller until shutdown signal received
    tokio::select! {
        _ = controller => {
            info!("Controller stream ended");
        }
        signal = wait_for_signal() => {
            match signal {
                Ok(signal) => info!(%signal, "Initiating graceful shutdown"),
                Err(e) => error!(error = %e, "Signal handlers unavailable, shutting down"),
            }
            // Mark not ready so K8s stops sending traffic during shutdown
            readiness.set_not_ready();
        }
    }

    shutdown_controller.shutdown();

    info!("Stopping components...");
    if let Err(e) = gauge_handle.await {
        warn!(error = %e, "Gauge refresher did not stop cleanly");
    }
    if let Err(e) = health_handle.await {
        warn!(error = %e, "Health server did not stop cleanly");
    }

    info!("Trial controller shut down gracefully");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
