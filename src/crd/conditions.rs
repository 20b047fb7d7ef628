//! Condition ledger helpers for Trial status
//!
//! Conditions are append-only per transition: setting a condition removes the
//! previous entry of the same type and appends the new one, so the last entry
//! is always the current lifecycle phase.

use super::trial::{ConditionStatus, Trial, TrialCondition, TrialConditionType, TrialStatus};

pub const TRIAL_CREATED_REASON: &str = "TrialCreated";
pub const TRIAL_RUNNING_REASON: &str = "TrialRunning";
pub const TRIAL_SUCCEEDED_REASON: &str = "TrialSucceeded";
pub const TRIAL_FAILED_REASON: &str = "TrialFailed";
pub const TRIAL_METRICS_UNAVAILABLE_REASON: &str = "MetricsUnavailable";

impl TrialStatus {
    pub fn condition(&self, condition_type: TrialConditionType) -> Option<&TrialCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// True if a condition of this type exists with status True
    pub fn has_condition(&self, condition_type: TrialConditionType) -> bool {
        self.condition(condition_type)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    pub fn last_condition_type(&self) -> Option<TrialConditionType> {
        self.conditions.last().map(|c| c.condition_type)
    }

    /// Record a condition transition
    ///
    /// No-op when an identical condition (status, reason, message) is present.
    /// `last_transition_time` is carried over when only reason/message changed.
    /// Other condition types are left alone.
    pub fn set_condition(
        &mut self,
        condition_type: TrialConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: &str,
    ) {
        let current = self.condition(condition_type);
        if let Some(c) = current {
            if c.status == status && c.reason == reason && c.message == message {
                return;
            }
        }

        let last_transition_time = match current {
            Some(c) if c.status == status => c.last_transition_time.clone(),
            _ => Some(now.to_string()),
        };

        let new_condition = TrialCondition {
            condition_type,
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_update_time: Some(now.to_string()),
            last_transition_time,
        };

        let mut conditions: Vec<TrialCondition> = self
            .conditions
            .drain(..)
            .filter(|c| c.condition_type != condition_type)
            .collect();
        conditions.push(new_condition);
        self.conditions = conditions;
    }
}

impl Trial {
    fn has_condition(&self, condition_type: TrialConditionType) -> bool {
        self.status
            .as_ref()
            .map(|s| s.has_condition(condition_type))
            .unwrap_or(false)
    }

    pub fn is_created(&self) -> bool {
        self.has_condition(TrialConditionType::Created)
    }

    pub fn is_running(&self) -> bool {
        self.has_condition(TrialConditionType::Running)
    }

    pub fn is_succeeded(&self) -> bool {
        self.has_condition(TrialConditionType::Succeeded)
    }

    pub fn is_failed(&self) -> bool {
        self.has_condition(TrialConditionType::Failed)
    }

    pub fn is_killed(&self) -> bool {
        self.has_condition(TrialConditionType::Killed)
    }

    pub fn is_early_stopped(&self) -> bool {
        self.has_condition(TrialConditionType::EarlyStopped)
    }

    pub fn is_metrics_unavailable(&self) -> bool {
        self.has_condition(TrialConditionType::MetricsUnavailable)
    }

    /// Terminal: no later reconcile may move the trial back to Running
    pub fn is_completed(&self) -> bool {
        self.is_succeeded()
            || self.is_failed()
            || self.is_killed()
            || self.is_early_stopped()
            || self.is_metrics_unavailable()
    }

    pub fn has_observation(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.observation.is_some())
            .unwrap_or(false)
    }
}
