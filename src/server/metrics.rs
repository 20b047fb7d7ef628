//! Prometheus metrics for the Trial controller
//!
//! Lifecycle counters are labeled by namespace; `trial_current` is a gauge of
//! trials per namespace and current phase, refreshed from the controller cache.

use crate::crd::trial::Trial;
use kube::ResourceExt;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Trial lifecycle transitions counted per namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Created,
    Deleted,
    Succeeded,
    Failed,
    MetricsUnavailable,
}

pub struct ControllerMetrics {
    registry: Registry,
    trials_created: IntCounterVec,
    trials_deleted: IntCounterVec,
    trials_succeeded: IntCounterVec,
    trials_failed: IntCounterVec,
    trials_metrics_unavailable: IntCounterVec,
    trials_current: IntGaugeVec,
    reconcile_errors: IntCounterVec,
    reconcile_duration: HistogramVec,
}

pub type SharedMetrics = Arc<ControllerMetrics>;

fn counter(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let trials_created = counter(
            &registry,
            "trial_created_total",
            "Total number of trials created",
            &["namespace"],
        )?;
        let trials_deleted = counter(
            &registry,
            "trial_deleted_total",
            "Total number of trials deleted",
            &["namespace"],
        )?;
        let trials_succeeded = counter(
            &registry,
            "trial_succeeded_total",
            "Total number of succeeded trials",
            &["namespace"],
        )?;
        let trials_failed = counter(
            &registry,
            "trial_failed_total",
            "Total number of failed trials",
            &["namespace"],
        )?;
        let trials_metrics_unavailable = counter(
            &registry,
            "trial_metrics_unavailable_total",
            "Total number of trials whose objective metric was never reported",
            &["namespace"],
        )?;
        let reconcile_errors = counter(
            &registry,
            "trial_reconcile_errors_total",
            "Total number of failed trial reconciliations",
            &["namespace"],
        )?;

        let trials_current = IntGaugeVec::new(
            Opts::new("trial_current", "Current number of trials by phase"),
            &["namespace", "status"],
        )?;
        registry.register(Box::new(trials_current.clone()))?;

        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new(
                "trial_reconcile_duration_seconds",
                "Duration of trial reconciliations in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["result"],
        )?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        Ok(ControllerMetrics {
            registry,
            trials_created,
            trials_deleted,
            trials_succeeded,
            trials_failed,
            trials_metrics_unavailable,
            trials_current,
            reconcile_errors,
            reconcile_duration,
        })
    }

    fn lifecycle_counter(&self, event: LifecycleEvent) -> &IntCounterVec {
        match event {
            LifecycleEvent::Created => &self.trials_created,
            LifecycleEvent::Deleted => &self.trials_deleted,
            LifecycleEvent::Succeeded => &self.trials_succeeded,
            LifecycleEvent::Failed => &self.trials_failed,
            LifecycleEvent::MetricsUnavailable => &self.trials_metrics_unavailable,
        }
    }

    pub fn record(&self, event: LifecycleEvent, namespace: &str) {
        self.lifecycle_counter(event)
            .with_label_values(&[namespace])
            .inc();
    }

    pub fn count(&self, event: LifecycleEvent, namespace: &str) -> u64 {
        self.lifecycle_counter(event)
            .with_label_values(&[namespace])
            .get()
    }

    pub fn record_reconcile(&self, success: bool, duration_secs: f64) {
        let result = if success { "success" } else { "error" };
        self.reconcile_duration
            .with_label_values(&[result])
            .observe(duration_secs);
    }

    pub fn record_reconcile_error(&self, namespace: &str) {
        self.reconcile_errors.with_label_values(&[namespace]).inc();
    }

    /// Recompute `trial_current` from a snapshot of all known trials
    ///
    /// A trial's phase is the type of its last condition; trials without
    /// conditions are counted as `Unknown`.
    pub fn set_current_trials<'a>(&self, trials: impl IntoIterator<Item = &'a Trial>) {
        let mut counts: BTreeMap<(String, String), i64> = BTreeMap::new();
        for trial in trials {
            let phase = trial
                .status
                .as_ref()
                .and_then(|s| s.last_condition_type())
                .map(|t| t.as_str())
                .unwrap_or("Unknown");
            *counts
                .entry((trial.namespace().unwrap_or_default(), phase.to_string()))
                .or_default() += 1;
        }

        self.trials_current.reset();
        for ((namespace, phase), count) in counts {
            self.trials_current
                .with_label_values(&[&namespace, &phase])
                .set(count);
        }
    }

    /// Encode all metrics in Prometheus text format
    pub fn encode(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| e.to_string())?;
        String::from_utf8(buffer).map_err(|e| e.to_string())
    }
}

pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
