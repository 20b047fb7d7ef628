//! Reconciler tests against in-memory cluster, manager and event fakes

use super::finalizer::has_cleanup_finalizer as finalizer_token_present;
use super::*;
use crate::controller::clock::MockClock;
use crate::controller::cluster::{ClusterClient, ClusterError, FakeCluster};
use crate::controller::events::MockEventPublisher;
use crate::controller::manager::MockObservationStore;
use crate::controller::registry::WorkloadRegistry;
use crate::crd::trial::{
    ConditionStatus, Trial, TrialConditionType, TrialSpec, UNAVAILABLE_METRIC_VALUE,
};
use crate::server::{create_metrics, LifecycleEvent, SharedMetrics};
use chrono::{TimeZone, Utc};
use kube::core::{ApiResource, GroupVersionKind};
use kube::runtime::controller::Action;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const NS: &str = "tuning";
const NOW: &str = "2026-03-04T05:06:07Z";

struct Harness {
    cluster: Arc<FakeCluster>,
    store: Arc<MockObservationStore>,
    events: Arc<MockEventPublisher>,
    metrics: SharedMetrics,
    ctx: Arc<Context>,
}

impl Harness {
    fn new() -> Self {
        let cluster = Arc::new(FakeCluster::new());
        let store = Arc::new(MockObservationStore::new());
        let events = Arc::new(MockEventPublisher::new());
        let metrics = create_metrics().unwrap();
        let registry = WorkloadRegistry::from_resources(vec![ApiResource::from_gvk(
            &GroupVersionKind::gvk("batch", "v1", "Job"),
        )]);
        let clock = Arc::new(MockClock::new(
            Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap(),
        ));
        let ctx = Arc::new(Context::new(
            cluster.clone(),
            store.clone(),
            events.clone(),
            registry,
            clock,
            Some(metrics.clone()),
        ));
        Harness {
            cluster,
            store,
            events,
            metrics,
            ctx,
        }
    }

    fn add_trial(&self, name: &str, run_spec: serde_json::Value, retain_run: bool) {
        let spec: TrialSpec = serde_json::from_value(json!({
            "objective": {
                "type": "maximize",
                "objectiveMetricName": "accuracy",
                "additionalMetricNames": ["loss"]
            },
            "runSpec": run_spec,
            "retainRun": retain_run,
            "successCondition": r#"status.conditions.#(type=="Complete")#|#(status=="True")#"#,
            "failureCondition": r#"status.conditions.#(type=="Failed")#|#(status=="True")#"#
        }))
        .unwrap();
        let mut trial = Trial::new(name, spec);
        trial.metadata.namespace = Some(NS.to_string());
        self.cluster.insert_trial(trial);
    }

    fn add_job_trial(&self, name: &str, retain_run: bool) {
        self.add_trial(
            name,
            json!({
                "apiVersion": "batch/v1",
                "kind": "Job",
                "spec": {"template": {"spec": {"restartPolicy": "Never"}}}
            }),
            retain_run,
        );
    }

    fn trial(&self, name: &str) -> Trial {
        self.cluster.trial(NS, name).expect("trial exists")
    }

    async fn reconcile(&self, name: &str) -> Result<Action, ReconcileError> {
        // The watch cache copy only identifies the Trial; reconcile re-reads it
        let spec: TrialSpec = serde_json::from_value(json!({
            "objective": {"objectiveMetricName": "accuracy"},
            "runSpec": {}
        }))
        .unwrap();
        let mut handle = Trial::new(name, spec);
        handle.metadata.namespace = Some(NS.to_string());
        reconcile(Arc::new(handle), self.ctx.clone()).await
    }

    /// Reconcile a new Trial through its finalizer and Created ticks
    async fn create_and_start(&self, name: &str, retain_run: bool) {
        self.add_job_trial(name, retain_run);
        assert_eq!(
            self.reconcile(name).await.unwrap(),
            Action::requeue(Duration::ZERO)
        );
        self.reconcile(name).await.unwrap();
        self.reconcile(name).await.unwrap();
        assert!(self.trial(name).is_running());
    }

    fn set_job_conditions(&self, name: &str, conditions: serde_json::Value) {
        self.cluster
            .set_workload_status(NS, name, json!({"conditions": conditions}));
    }

    async fn set_condition(&self, name: &str, condition_type: TrialConditionType) {
        let mut trial = self.trial(name);
        trial.status.as_mut().unwrap().set_condition(
            condition_type,
            ConditionStatus::True,
            "External",
            "set by test",
            NOW,
        );
        self.cluster.replace_trial_status(&trial).await.unwrap();
    }
}

fn complete() -> serde_json::Value {
    json!([{"type": "Complete", "status": "True", "reason": "Done", "message": "Job finished"}])
}

fn failed() -> serde_json::Value {
    json!([{"type": "Failed", "status": "True", "reason": "BackoffLimitExceeded", "message": "too many retries"}])
}

#[tokio::test]
async fn test_new_trial_gets_finalizer_then_created_only() {
    let h = Harness::new();
    h.add_job_trial("t1", false);

    let action = h.reconcile("t1").await.unwrap();
    assert_eq!(action, Action::requeue(Duration::ZERO));
    assert!(finalizer_token_present(&h.trial("t1")));
    assert_eq!(h.metrics.count(LifecycleEvent::Created, NS), 1);

    let action = h.reconcile("t1").await.unwrap();
    assert_eq!(action, Action::await_change());
    let trial = h.trial("t1");
    let status = trial.status.as_ref().unwrap();
    assert_eq!(status.conditions.len(), 1);
    assert!(trial.is_created());
    assert_eq!(status.start_time.as_deref(), Some(NOW));
    assert_eq!(status.completion_time, None);
    assert_eq!(status.last_reconcile_time.as_deref(), Some(NOW));
    assert!(h.cluster.workload(NS, "t1").is_none());
}

#[tokio::test]
async fn test_second_tick_creates_workload_and_runs() {
    let h = Harness::new();
    h.add_job_trial("t1", false);
    h.reconcile("t1").await.unwrap();
    h.reconcile("t1").await.unwrap();

    h.reconcile("t1").await.unwrap();

    let workload = h.cluster.workload(NS, "t1").expect("workload created");
    let owner = &workload.metadata.owner_references.as_ref().unwrap()[0];
    assert_eq!(owner.name, "t1");
    assert_eq!(owner.controller, Some(true));

    let trial = h.trial("t1");
    assert!(trial.is_running());
    assert_eq!(
        trial.status.as_ref().unwrap().last_condition_type(),
        Some(TrialConditionType::Running)
    );
    assert_eq!(h.events.reasons(), vec!["JobCreated", "JobRunning"]);
}

#[tokio::test]
async fn test_success_without_samples_requeues_without_writing() {
    let h = Harness::new();
    h.create_and_start("t1", false).await;
    h.set_job_conditions("t1", complete());
    let before = h.trial("t1");
    h.cluster.clear_calls();

    let action = h.reconcile("t1").await.unwrap();

    assert_eq!(action, Action::requeue(Duration::from_secs(1)));
    assert_eq!(h.trial("t1").status, before.status);
    assert!(h.cluster.calls().is_empty());
    assert_eq!(h.metrics.count(LifecycleEvent::Succeeded, NS), 0);
}

#[tokio::test]
async fn test_success_with_objective_sample_completes_trial() {
    let h = Harness::new();
    h.create_and_start("t1", true).await;
    h.set_job_conditions("t1", complete());
    assert_eq!(
        h.reconcile("t1").await.unwrap(),
        Action::requeue(Duration::from_secs(1))
    );

    h.store
        .report("t1", "accuracy", "0.87", "2026-03-04T05:00:00Z");
    let action = h.reconcile("t1").await.unwrap();
    assert_eq!(action, Action::await_change());

    let trial = h.trial("t1");
    let status = trial.status.as_ref().unwrap();
    assert!(trial.is_succeeded());
    assert!(!trial.is_running());
    assert_eq!(
        status.condition(TrialConditionType::Running).unwrap().reason,
        "TrialRunning"
    );
    assert_eq!(status.completion_time.as_deref(), Some(NOW));
    let observation = status.observation.as_ref().unwrap();
    assert_eq!(observation.metric("accuracy").unwrap().latest, "0.87");
    assert_eq!(
        observation.metric("loss").unwrap().latest,
        UNAVAILABLE_METRIC_VALUE
    );
    assert_eq!(h.metrics.count(LifecycleEvent::Succeeded, NS), 1);
    assert!(h.events.reasons().contains(&"JobSucceeded".to_string()));
}

#[tokio::test]
async fn test_additional_metric_without_objective_keeps_waiting() {
    let h = Harness::new();
    h.create_and_start("t1", true).await;
    h.set_job_conditions("t1", complete());
    h.store.report("t1", "loss", "0.4", "2026-03-04T05:00:00Z");
    let before = h.trial("t1");
    h.cluster.clear_calls();

    let action = h.reconcile("t1").await.unwrap();

    assert_eq!(action, Action::requeue(Duration::from_secs(1)));
    let trial = h.trial("t1");
    assert_eq!(trial.status, before.status);
    assert!(!trial.is_metrics_unavailable());
    assert!(!trial.is_completed());
    assert!(h.cluster.calls().is_empty());
    assert_eq!(h.metrics.count(LifecycleEvent::MetricsUnavailable, NS), 0);

    // The objective arrives on a later tick
    h.store
        .report("t1", "accuracy", "0.9", "2026-03-04T05:01:00Z");
    h.reconcile("t1").await.unwrap();
    let trial = h.trial("t1");
    assert!(trial.is_succeeded());
    let observation = trial.status.as_ref().unwrap().observation.clone().unwrap();
    assert_eq!(observation.metric("loss").unwrap().latest, "0.4");
}

#[tokio::test]
async fn test_unavailable_objective_metric_marks_metrics_unavailable() {
    let h = Harness::new();
    h.create_and_start("t1", true).await;
    h.set_job_conditions("t1", complete());
    h.store.report(
        "t1",
        "accuracy",
        UNAVAILABLE_METRIC_VALUE,
        "2026-03-04T05:00:00Z",
    );
    h.store.report("t1", "loss", "0.4", "2026-03-04T05:00:00Z");

    h.reconcile("t1").await.unwrap();

    let trial = h.trial("t1");
    assert!(trial.is_metrics_unavailable());
    assert!(!trial.is_succeeded());
    assert!(trial.is_completed());
    assert_eq!(h.metrics.count(LifecycleEvent::MetricsUnavailable, NS), 1);
    assert_eq!(h.metrics.count(LifecycleEvent::Succeeded, NS), 0);
}

#[tokio::test]
async fn test_failed_workload_fails_trial_once() {
    let h = Harness::new();
    h.create_and_start("t1", true).await;
    h.set_job_conditions("t1", failed());

    h.reconcile("t1").await.unwrap();

    let trial = h.trial("t1");
    assert!(trial.is_failed());
    assert!(!trial.is_running());
    let status = trial.status.as_ref().unwrap();
    assert_eq!(status.completion_time.as_deref(), Some(NOW));
    assert_eq!(
        status.condition(TrialConditionType::Failed).unwrap().reason,
        "TrialFailed. Job reason: BackoffLimitExceeded"
    );
    assert_eq!(h.metrics.count(LifecycleEvent::Failed, NS), 1);

    // Same workload document again: nothing to do
    h.cluster.clear_calls();
    h.reconcile("t1").await.unwrap();
    assert!(h.cluster.calls().is_empty());
    assert_eq!(h.trial("t1").status, trial.status);
    assert_eq!(h.metrics.count(LifecycleEvent::Failed, NS), 1);
    assert!(h.store.calls().is_empty());
}

#[tokio::test]
async fn test_deleting_trial_cleans_observation_log_then_disappears() {
    let h = Harness::new();
    h.create_and_start("t1", false).await;
    h.cluster.request_trial_deletion(NS, "t1");

    let action = h.reconcile("t1").await.unwrap();
    assert_eq!(action, Action::requeue(Duration::ZERO));
    assert_eq!(h.store.calls(), vec!["delete:t1"]);
    assert!(h.cluster.trial(NS, "t1").is_none());
    assert_eq!(h.metrics.count(LifecycleEvent::Deleted, NS), 1);

    let action = h.reconcile("t1").await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(h.store.calls(), vec!["delete:t1"]);
}

#[tokio::test]
async fn test_failed_cleanup_keeps_finalizer() {
    let h = Harness::new();
    h.create_and_start("t1", false).await;
    h.cluster.request_trial_deletion(NS, "t1");
    h.store.set_fail_delete(true);

    let result = h.reconcile("t1").await;
    assert!(matches!(result, Err(ReconcileError::Manager(_))));
    assert!(finalizer_token_present(&h.trial("t1")));

    h.store.set_fail_delete(false);
    h.reconcile("t1").await.unwrap();
    assert!(h.cluster.trial(NS, "t1").is_none());
    assert_eq!(h.store.calls(), vec!["delete:t1", "delete:t1"]);
}

#[tokio::test]
async fn test_quiet_running_trial_is_idempotent() {
    let h = Harness::new();
    h.create_and_start("t1", false).await;
    let before = h.trial("t1");
    let events_before = h.events.reasons().len();
    h.cluster.clear_calls();

    for _ in 0..2 {
        assert_eq!(h.reconcile("t1").await.unwrap(), Action::await_change());
    }

    assert!(h.cluster.calls().is_empty());
    assert_eq!(h.trial("t1").status, before.status);
    assert_eq!(h.events.reasons().len(), events_before);
}

#[tokio::test]
async fn test_failure_wins_over_success() {
    let h = Harness::new();
    h.create_and_start("t1", true).await;
    h.set_job_conditions(
        "t1",
        json!([
            {"type": "Complete", "status": "True"},
            {"type": "Failed", "status": "True"}
        ]),
    );

    h.reconcile("t1").await.unwrap();

    let trial = h.trial("t1");
    assert!(trial.is_failed());
    assert!(!trial.is_succeeded());
    assert!(h.store.calls().is_empty());
}

#[tokio::test]
async fn test_terminal_trials_never_return_to_running() {
    let h = Harness::new();
    h.create_and_start("t1", true).await;
    h.set_job_conditions("t1", failed());
    h.reconcile("t1").await.unwrap();
    assert!(h.trial("t1").is_failed());

    // Workload looks fresh again; the failed trial stays terminal
    h.set_job_conditions("t1", json!([]));
    h.reconcile("t1").await.unwrap();
    let trial = h.trial("t1");
    assert!(!trial.is_running());
    assert!(trial.is_failed());
}

#[tokio::test]
async fn test_early_stopped_trial_syncs_metrics_then_tears_down() {
    let h = Harness::new();
    h.create_and_start("t1", false).await;
    h.set_condition("t1", TrialConditionType::EarlyStopped).await;
    h.set_job_conditions("t1", complete());
    h.store
        .report("t1", "accuracy", "0.61", "2026-03-04T05:00:00Z");

    // Final metrics sync while the workload is kept
    h.reconcile("t1").await.unwrap();
    let trial = h.trial("t1");
    assert!(trial.has_observation());
    assert!(!trial.is_succeeded());
    assert!(h.cluster.workload(NS, "t1").is_some());

    // Then teardown
    h.reconcile("t1").await.unwrap();
    assert!(h.cluster.workload(NS, "t1").is_none());
    assert!(h.trial("t1").is_early_stopped());
    assert!(!h.trial("t1").is_succeeded());
}

#[tokio::test]
async fn test_completed_trial_workload_deleted_unless_retained() {
    let h = Harness::new();
    h.create_and_start("t1", false).await;
    h.set_job_conditions("t1", failed());
    h.reconcile("t1").await.unwrap();
    assert!(h.cluster.workload(NS, "t1").is_some());

    h.reconcile("t1").await.unwrap();
    assert!(h.cluster.workload(NS, "t1").is_none());
    assert!(h.events.reasons().contains(&"JobDeleted".to_string()));

    // Not recreated for a terminal trial
    h.cluster.clear_calls();
    h.reconcile("t1").await.unwrap();
    assert!(h.cluster.calls().is_empty());
}

#[tokio::test]
async fn test_unregistered_workload_kind_is_an_error() {
    let h = Harness::new();
    h.add_trial(
        "tf",
        json!({"apiVersion": "kubeflow.org/v1", "kind": "TFJob", "spec": {}}),
        false,
    );
    h.reconcile("tf").await.unwrap();
    h.reconcile("tf").await.unwrap();

    let result = h.reconcile("tf").await;
    assert!(matches!(result, Err(ReconcileError::UnknownWorkloadKind(_))));
}

#[tokio::test]
async fn test_malformed_expression_is_an_error() {
    let h = Harness::new();
    h.create_and_start("t1", false).await;
    let mut trial = h.trial("t1");
    trial.spec.failure_condition = "status.conditions.#(type==".to_string();
    h.cluster.insert_trial(trial);

    let result = h.reconcile("t1").await;
    assert!(matches!(result, Err(ReconcileError::Expression(_))));
}

#[tokio::test]
async fn test_status_conflict_surfaces_and_backs_off() {
    let h = Harness::new();
    h.add_job_trial("t1", false);
    h.reconcile("t1").await.unwrap();
    h.cluster.conflict_next_status_write();

    let result = h.reconcile("t1").await;
    let error = result.unwrap_err();
    assert!(matches!(
        error,
        ReconcileError::Cluster(ClusterError::Conflict(_))
    ));

    let trial = Arc::new(h.trial("t1"));
    assert_eq!(
        error_policy(trial.clone(), &error, h.ctx.clone()),
        Action::requeue(Duration::from_secs(1))
    );
    assert_eq!(
        error_policy(trial.clone(), &error, h.ctx.clone()),
        Action::requeue(Duration::from_secs(2))
    );

    // Let the spawned event publish run
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.events.warnings(), 2);

    // A successful reconcile resets the backoff
    h.reconcile("t1").await.unwrap();
    assert!(h.trial("t1").is_created());
    assert_eq!(
        error_policy(trial, &error, h.ctx.clone()),
        Action::requeue(Duration::from_secs(1))
    );
}

#[test]
fn test_backoff_is_capped() {
    let backoff = ErrorBackoff::new(Duration::from_secs(1), Duration::from_secs(300));
    let delays: Vec<_> = (0..12).map(|_| backoff.next_delay("ns/t")).collect();
    assert_eq!(delays[0], Duration::from_secs(1));
    assert_eq!(delays[3], Duration::from_secs(8));
    assert_eq!(delays[11], Duration::from_secs(300));
    assert_eq!(backoff.next_delay("ns/other"), Duration::from_secs(1));
}
