use super::observation::aggregate;
use super::ReconcileError;
use crate::controller::expression::{JobCondition, TrialJobStatus};
use crate::controller::manager::ObservationStore;
use crate::crd::conditions::{
    TRIAL_CREATED_REASON, TRIAL_FAILED_REASON, TRIAL_METRICS_UNAVAILABLE_REASON,
    TRIAL_RUNNING_REASON, TRIAL_SUCCEEDED_REASON,
};
use crate::crd::trial::{
    ConditionStatus, Observation, Trial, TrialConditionType, TrialStatus,
    UNAVAILABLE_METRIC_VALUE,
};
use kube::ResourceExt;
use tracing::{debug, info};

fn status_mut(trial: &mut Trial) -> &mut TrialStatus {
    trial.status.get_or_insert_with(TrialStatus::default)
}

/// First transition of a new Trial: Created=True and the start time
pub fn mark_created(trial: &mut Trial, now: &str) {
    let status = status_mut(trial);
    if status.start_time.is_none() {
        status.start_time = Some(now.to_string());
    }
    status.set_condition(
        TrialConditionType::Created,
        ConditionStatus::True,
        TRIAL_CREATED_REASON,
        "Trial is created",
        now,
    );
}

/// Fold one workload classification into the Trial's status
///
/// Returns `ReconcileError::MetricsNotReported` (leaving status untouched) when
/// a finished workload has no objective samples in the observation log yet.
pub async fn apply_job_status(
    trial: &mut Trial,
    job: &TrialJobStatus,
    manager: &dyn ObservationStore,
    now: &str,
) -> Result<(), ReconcileError> {
    if job.condition == JobCondition::Succeeded || trial.is_early_stopped() {
        if !trial.has_observation() {
            let observation = fetch_observation(trial, manager).await?;
            status_mut(trial).observation = Some(observation);
        }

        if objective_unavailable(trial) {
            if !trial.is_metrics_unavailable() {
                let (reason, message) = with_job_details(
                    TRIAL_METRICS_UNAVAILABLE_REASON,
                    "Metrics are not available",
                    job,
                );
                info!(trial = ?trial.name_any(), "Objective metric unavailable");
                end_run(trial, TrialConditionType::MetricsUnavailable, &reason, &message, now);
            }
        } else if !trial.is_early_stopped() {
            let (reason, message) =
                with_job_details(TRIAL_SUCCEEDED_REASON, "Trial has succeeded", job);
            info!(trial = ?trial.name_any(), "Trial succeeded");
            end_run(trial, TrialConditionType::Succeeded, &reason, &message, now);
        }
    } else if job.condition == JobCondition::Failed && !trial.is_failed() && !trial.is_early_stopped()
    {
        let (reason, message) = with_job_details(TRIAL_FAILED_REASON, "Trial has failed", job);
        info!(trial = ?trial.name_any(), reason = %job.reason, "Trial failed");
        end_run(trial, TrialConditionType::Failed, &reason, &message, now);
    } else if job.condition == JobCondition::Running
        && !trial.is_running()
        && !trial.is_early_stopped()
    {
        debug!(trial = ?trial.name_any(), "Trial running");
        status_mut(trial).set_condition(
            TrialConditionType::Running,
            ConditionStatus::True,
            TRIAL_RUNNING_REASON,
            "Trial is running",
            now,
        );
    }
    Ok(())
}

/// Collect every tracked metric's samples and reduce them to an observation
///
/// The objective log is read first; while it is empty the observation is not
/// ready, whatever the additional metrics already hold.
async fn fetch_observation(
    trial: &Trial,
    manager: &dyn ObservationStore,
) -> Result<Observation, ReconcileError> {
    let name = trial.name_any();
    let objective = &trial.spec.objective.objective_metric_name;
    let tracked = trial.spec.objective.tracked_metric_names();

    let mut samples = manager.get_observation_log(&name, objective).await?;
    if samples.is_empty() {
        return Err(ReconcileError::MetricsNotReported);
    }
    for metric in tracked.iter().filter(|m| *m != objective) {
        samples.extend(manager.get_observation_log(&name, metric).await?);
    }

    debug!(trial = ?name, samples = samples.len(), "Aggregating observation log");
    Ok(aggregate(&samples, &tracked))
}

fn objective_unavailable(trial: &Trial) -> bool {
    let objective = &trial.spec.objective.objective_metric_name;
    trial
        .status
        .as_ref()
        .and_then(|s| s.observation.as_ref())
        .and_then(|o| o.metric(objective))
        .map(|m| m.latest == UNAVAILABLE_METRIC_VALUE)
        .unwrap_or(true)
}

/// Append the workload's own reason/message when present
fn with_job_details(reason: &str, message: &str, job: &TrialJobStatus) -> (String, String) {
    let message = if job.message.is_empty() {
        message.to_string()
    } else {
        format!("{}. Job message: {}", message, job.message)
    };
    let reason = if job.reason.is_empty() {
        reason.to_string()
    } else {
        format!("{}. Job reason: {}", reason, job.reason)
    };
    (reason, message)
}

/// Record a terminal condition: Running flips to False keeping its reason and
/// message, then the terminal condition is appended and completion time set.
fn end_run(
    trial: &mut Trial,
    condition_type: TrialConditionType,
    reason: &str,
    message: &str,
    now: &str,
) {
    let status = status_mut(trial);
    if let Some(running) = status.condition(TrialConditionType::Running).cloned() {
        status.set_condition(
            TrialConditionType::Running,
            ConditionStatus::False,
            &running.reason,
            &running.message,
            now,
        );
    }
    status.set_condition(condition_type, ConditionStatus::True, reason, message, now);
    status.completion_time = Some(now.to_string());
}
