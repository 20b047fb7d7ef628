use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Value recorded for a metric that was never reported.
pub const UNAVAILABLE_METRIC_VALUE: &str = "unavailable";

/// Trial is one training run with one parameter assignment
///
/// Created by the experiment controller, driven to completion by the trial
/// controller through an owned workload of any kind (batch Job, TFJob, ...).
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "kubeflow.org",
    version = "v1beta1",
    kind = "Trial",
    namespaced,
    status = "TrialStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".status.conditions[-1:].type"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.conditions[-1:].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct TrialSpec {
    /// Objective of the experiment this trial belongs to
    pub objective: ObjectiveSpec,

    /// Parameter values chosen by the suggestion service
    #[serde(rename = "parameterAssignments", default)]
    pub parameter_assignments: Vec<ParameterAssignment>,

    /// Workload template. Any apiVersion/kind; the controller treats it as opaque.
    #[serde(rename = "runSpec")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub run_spec: serde_json::Value,

    /// Keep the workload after the trial completes
    #[serde(rename = "retainRun", default)]
    pub retain_run: bool,

    /// Expression that matches the workload status when it succeeded
    #[serde(rename = "successCondition", default)]
    pub success_condition: String,

    /// Expression that matches the workload status when it failed
    #[serde(rename = "failureCondition", default)]
    pub failure_condition: String,

    #[serde(rename = "metricsCollector", skip_serializing_if = "Option::is_none")]
    pub metrics_collector: Option<MetricsCollectorSpec>,

    /// Labels identifying the primary pod, used by sidecar injection
    #[serde(rename = "primaryPodLabels", skip_serializing_if = "Option::is_none")]
    pub primary_pod_labels: Option<BTreeMap<String, String>>,

    /// Name of the training container, used by sidecar injection
    #[serde(
        rename = "primaryContainerName",
        skip_serializing_if = "Option::is_none"
    )]
    pub primary_container_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

fn preserve_unknown_fields(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ObjectiveSpec {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub objective_type: Option<ObjectiveType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal: Option<f64>,

    #[serde(rename = "objectiveMetricName")]
    pub objective_metric_name: String,

    #[serde(rename = "additionalMetricNames", default)]
    pub additional_metric_names: Vec<String>,

    /// Per-metric aggregation strategy. Carried for consumers of the
    /// observation; the controller always records min, max and latest.
    #[serde(rename = "metricStrategies", default)]
    pub metric_strategies: Vec<MetricStrategy>,
}

impl ObjectiveSpec {
    /// Objective metric first, then additional metrics, without duplicates
    pub fn tracked_metric_names(&self) -> Vec<String> {
        let mut names = vec![self.objective_metric_name.clone()];
        for name in &self.additional_metric_names {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub enum ObjectiveType {
    #[serde(rename = "minimize")]
    Minimize,
    #[serde(rename = "maximize")]
    Maximize,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct MetricStrategy {
    pub name: String,
    pub value: MetricStrategyType,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub enum MetricStrategyType {
    #[serde(rename = "min")]
    Min,
    #[serde(rename = "max")]
    Max,
    #[serde(rename = "latest")]
    Latest,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct ParameterAssignment {
    pub name: String,
    pub value: String,
}

/// Metrics collector configuration, consumed by the sidecar injector
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct MetricsCollectorSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collector: Option<CollectorSpec>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub source: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct CollectorSpec {
    pub kind: CollectorKind,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub enum CollectorKind {
    StdOut,
    File,
    TensorFlowEvent,
    PrometheusMetric,
    Custom,
    Push,
    None,
}

/// Status of the Trial
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct TrialStatus {
    /// RFC3339 time the trial was first seen by the controller
    #[serde(rename = "startTime", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    /// RFC3339 time the trial reached a terminal condition; absent while running
    #[serde(rename = "completionTime", skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,

    #[serde(rename = "lastReconcileTime", skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<String>,

    /// Lifecycle ledger; the last entry is the current phase
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<TrialCondition>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation: Option<Observation>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct TrialCondition {
    #[serde(rename = "type")]
    pub condition_type: TrialConditionType,

    pub status: ConditionStatus,

    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub message: String,

    #[serde(rename = "lastUpdateTime", skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,

    #[serde(
        rename = "lastTransitionTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_transition_time: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum TrialConditionType {
    Created,
    Running,
    Succeeded,
    Killed,
    Failed,
    MetricsUnavailable,
    EarlyStopped,
}

impl TrialConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Killed => "Killed",
            Self::Failed => "Failed",
            Self::MetricsUnavailable => "MetricsUnavailable",
            Self::EarlyStopped => "EarlyStopped",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Aggregated view of the metrics a trial reported
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct Observation {
    #[serde(default)]
    pub metrics: Vec<Metric>,
}

impl Observation {
    pub fn metric(&self, name: &str) -> Option<&Metric> {
        self.metrics.iter().find(|m| m.name == name)
    }
}

/// Min, max and latest value of one metric, as decimal strings
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct Metric {
    pub name: String,
    pub min: String,
    pub max: String,
    pub latest: String,
}

impl Metric {
    pub fn unavailable(name: &str) -> Self {
        Metric {
            name: name.to_string(),
            min: UNAVAILABLE_METRIC_VALUE.to_string(),
            max: UNAVAILABLE_METRIC_VALUE.to_string(),
            latest: UNAVAILABLE_METRIC_VALUE.to_string(),
        }
    }
}
