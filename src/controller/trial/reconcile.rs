use super::{finalizer, status, workload};
use crate::controller::clock::Clock;
use crate::controller::cluster::{ClusterClient, ClusterError};
use crate::controller::events::{actions, reasons, EventPublisher};
use crate::controller::expression::{self, ExpressionError};
use crate::controller::manager::{ManagerError, ObservationStore};
use crate::controller::registry::WorkloadRegistry;
use crate::crd::trial::{Trial, TrialConditionType};
use crate::server::{LifecycleEvent, SharedMetrics};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Delay before re-checking for metrics of a finished workload
pub const METRICS_PENDING_REQUEUE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{0}")]
    Cluster(#[from] ClusterError),

    #[error("Trial missing namespace")]
    MissingNamespace,

    #[error("Invalid workload template: {0}")]
    InvalidTemplate(String),

    #[error("Failed to set owner reference on workload: {0}")]
    OwnerReference(String),

    #[error("Workload kind {0} is not watched by this controller")]
    UnknownWorkloadKind(String),

    #[error("Failed to serialize workload: {0}")]
    SerializationError(String),

    #[error("Invalid condition expression: {0}")]
    Expression(#[from] ExpressionError),

    #[error("Observation log request failed: {0}")]
    Manager(#[from] ManagerError),

    /// Workload finished but no samples are stored yet; retried on a short fixed delay
    #[error("Metrics are not reported yet")]
    MetricsNotReported,
}

/// Per-trial exponential backoff for failed reconciles
pub struct ErrorBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ErrorBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        ErrorBackoff {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure and return the delay before the next attempt
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut failures = match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let attempt = failures.entry(key.to_string()).or_insert(0);
        let delay = self
            .base
            .saturating_mul(2u32.saturating_pow(*attempt))
            .min(self.max);
        *attempt = attempt.saturating_add(1);
        delay
    }

    pub fn reset(&self, key: &str) {
        let mut failures = match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        failures.remove(key);
    }
}

impl Default for ErrorBackoff {
    fn default() -> Self {
        ErrorBackoff::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}

pub struct Context {
    pub cluster: Arc<dyn ClusterClient>,
    pub manager: Arc<dyn ObservationStore>,
    pub events: Arc<dyn EventPublisher>,
    pub registry: WorkloadRegistry,
    pub clock: Arc<dyn Clock>,
    /// When Some, lifecycle counters and reconcile durations are recorded
    pub metrics: Option<SharedMetrics>,
    pub backoff: ErrorBackoff,
}

impl Context {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        manager: Arc<dyn ObservationStore>,
        events: Arc<dyn EventPublisher>,
        registry: WorkloadRegistry,
        clock: Arc<dyn Clock>,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Context {
            cluster,
            manager,
            events,
            registry,
            clock,
            metrics,
            backoff: ErrorBackoff::default(),
        }
    }

    fn record(&self, event: LifecycleEvent, namespace: &str) {
        if let Some(ref metrics) = self.metrics {
            metrics.record(event, namespace);
        }
    }
}

fn trial_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Reconcile a Trial
///
/// 1. Re-reads the Trial; a missing Trial is already deleted
/// 2. Adds or (after observation-log cleanup) removes the cleanup finalizer
/// 3. Marks a new Trial Created
/// 4. Creates, keeps or tears down the owned workload
/// 5. Classifies the workload and advances the Trial's conditions
/// 6. Writes status when it changed
///
/// # Returns
/// * `Ok(Action)` - Immediate requeue after a finalizer write, a short requeue
///   while metrics are pending, otherwise wait for the next change
/// * `Err(ReconcileError)` - Reconciliation error, retried with backoff
pub async fn reconcile(trial: Arc<Trial>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let start_time = Instant::now();
    let namespace = trial.namespace().ok_or(ReconcileError::MissingNamespace)?;
    let name = trial.name_any();

    debug!(trial = ?name, namespace = ?namespace, "Reconciling Trial");

    let result = reconcile_trial(&namespace, &name, &ctx).await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.record_reconcile(result.is_ok(), start_time.elapsed().as_secs_f64());
    }
    if result.is_ok() {
        ctx.backoff.reset(&trial_key(&namespace, &name));
    }
    result
}

async fn reconcile_trial(
    namespace: &str,
    name: &str,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    let Some(original) = ctx.cluster.get_trial(namespace, name).await? else {
        debug!(trial = ?name, "Trial not found, already deleted");
        return Ok(Action::await_change());
    };

    if let Some(finalizers) = finalizer::needs_update(&original, ctx.manager.as_ref()).await? {
        let deleting = finalizer::is_deleting(&original);
        ctx.cluster
            .replace_trial_finalizers(&original, finalizers)
            .await?;
        if deleting {
            info!(trial = ?name, "Cleanup finalizer removed");
            ctx.record(LifecycleEvent::Deleted, namespace);
        } else {
            info!(trial = ?name, "Cleanup finalizer added");
            ctx.record(LifecycleEvent::Created, namespace);
        }
        return Ok(Action::requeue(Duration::ZERO));
    }

    let now = ctx.clock.timestamp();
    let mut trial = original.clone();

    if !trial.is_created() {
        info!(trial = ?name, namespace = ?namespace, "Trial created");
        status::mark_created(&mut trial, &now);
    } else {
        match reconcile_workload_and_status(&mut trial, ctx, &now).await {
            Err(ReconcileError::MetricsNotReported) => {
                info!(trial = ?name, "Metrics not reported yet, checking again shortly");
                return Ok(Action::requeue(METRICS_PENDING_REQUEUE));
            }
            other => other?,
        }
    }

    if trial.status != original.status {
        if let Some(status) = trial.status.as_mut() {
            status.last_reconcile_time = Some(now);
        }
        ctx.cluster.replace_trial_status(&trial).await?;
        debug!(
            trial = ?name,
            phase = ?trial.status.as_ref().and_then(|s| s.last_condition_type()),
            "Trial status updated"
        );
        record_transitions(&original, &trial, namespace, ctx).await;
    }

    Ok(Action::await_change())
}

async fn reconcile_workload_and_status(
    trial: &mut Trial,
    ctx: &Context,
    now: &str,
) -> Result<(), ReconcileError> {
    let desired = workload::desired_workload(trial)?;
    let resource = workload::workload_resource(&desired, ctx)?;
    let Some(current) = workload::reconcile_workload(trial, &desired, &resource, ctx).await? else {
        return Ok(());
    };

    if trial.is_completed() && !trial.is_early_stopped() {
        return Ok(());
    }

    let document = serde_json::to_value(&current)
        .map_err(|e| ReconcileError::SerializationError(e.to_string()))?;
    let job_status = expression::evaluate(
        &document,
        &trial.spec.failure_condition,
        &trial.spec.success_condition,
        trial.is_running(),
        current.metadata.uid.is_some(),
    )?;

    match job_status {
        Some(job) => status::apply_job_status(trial, &job, ctx.manager.as_ref(), now).await,
        None => Ok(()),
    }
}

/// Count and announce conditions that became true with the last status write
async fn record_transitions(before: &Trial, after: &Trial, namespace: &str, ctx: &Context) {
    let transitions = [
        (
            TrialConditionType::Running,
            None,
            EventType::Normal,
            reasons::JOB_RUNNING,
        ),
        (
            TrialConditionType::Succeeded,
            Some(LifecycleEvent::Succeeded),
            EventType::Normal,
            reasons::JOB_SUCCEEDED,
        ),
        (
            TrialConditionType::Failed,
            Some(LifecycleEvent::Failed),
            EventType::Warning,
            reasons::JOB_FAILED,
        ),
        (
            TrialConditionType::MetricsUnavailable,
            Some(LifecycleEvent::MetricsUnavailable),
            EventType::Warning,
            reasons::METRICS_UNAVAILABLE,
        ),
    ];

    let has = |trial: &Trial, condition_type| {
        trial
            .status
            .as_ref()
            .map(|s| s.has_condition(condition_type))
            .unwrap_or(false)
    };

    for (condition_type, counter, type_, reason) in transitions {
        if has(before, condition_type) || !has(after, condition_type) {
            continue;
        }
        if let Some(event) = counter {
            ctx.record(event, namespace);
        }
        let note = after
            .status
            .as_ref()
            .and_then(|s| s.condition(condition_type))
            .map(|c| c.message.clone());
        ctx.events
            .publish(
                &after.object_ref(&()),
                type_,
                reason,
                actions::RECONCILE,
                note,
            )
            .await;
    }
}

/// Error policy for the controller
///
/// Logs, counts and records a Warning event, then requeues with per-trial
/// exponential backoff.
pub fn error_policy(trial: Arc<Trial>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    let namespace = trial.namespace().unwrap_or_default();
    let name = trial.name_any();
    let delay = ctx.backoff.next_delay(&trial_key(&namespace, &name));

    warn!(trial = ?name, namespace = ?namespace, error = %error, retry_in = ?delay, "Reconcile error (will retry)");

    if let Some(ref metrics) = ctx.metrics {
        metrics.record_reconcile_error(&namespace);
    }

    let events = ctx.events.clone();
    let object_ref = trial.object_ref(&());
    let note = error.to_string();
    tokio::spawn(async move {
        events
            .publish(
                &object_ref,
                EventType::Warning,
                reasons::RECONCILE_FAILED,
                actions::RECONCILE,
                Some(note),
            )
            .await;
    });

    Action::requeue(delay)
}
