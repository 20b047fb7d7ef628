//! Workload status classification
//!
//! Turns an opaque workload document into a `TrialJobStatus` using the
//! operator-authored success and failure expressions of the Trial. Works for
//! any workload kind as long as the expressions match that kind's status shape.

pub mod query;

pub use query::{ExpressionError, Query};

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCondition {
    Running,
    Succeeded,
    Failed,
}

/// Single-tick classification of a workload, folded into Trial status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialJobStatus {
    pub condition: JobCondition,
    pub reason: String,
    pub message: String,
}

impl TrialJobStatus {
    fn running() -> Self {
        TrialJobStatus {
            condition: JobCondition::Running,
            reason: String::new(),
            message: String::new(),
        }
    }

    fn from_match(condition: JobCondition, matched: &Value) -> Self {
        let field = |name: &str| {
            matched
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        TrialJobStatus {
            condition,
            reason: field("reason"),
            message: field("message"),
        }
    }
}

/// Classify a workload
///
/// Failure is checked before success, so a document matching both is Failed.
/// With no match, a workload that exists but is not yet known to be running
/// is reported as Running; otherwise there is nothing to act on.
///
/// # Arguments
/// * `workload` - The full workload object (expressions usually start at `status`)
/// * `failure_expr` / `success_expr` - Condition expressions; empty never matches
/// * `trial_running` - Trial already carries Running=True
/// * `has_generated_name` - Workload exists as a created resource
pub fn evaluate(
    workload: &Value,
    failure_expr: &str,
    success_expr: &str,
    trial_running: bool,
    has_generated_name: bool,
) -> Result<Option<TrialJobStatus>, ExpressionError> {
    if let Some(matched) = match_expression(workload, failure_expr)? {
        return Ok(Some(TrialJobStatus::from_match(
            JobCondition::Failed,
            &matched,
        )));
    }

    if let Some(matched) = match_expression(workload, success_expr)? {
        return Ok(Some(TrialJobStatus::from_match(
            JobCondition::Succeeded,
            &matched,
        )));
    }

    if !trial_running && has_generated_name {
        return Ok(Some(TrialJobStatus::running()));
    }

    Ok(None)
}

/// Evaluate one expression and reduce the result to a single matched value
///
/// `null`, `false`, and empty collections are not a match. A non-empty array
/// yields its first element.
fn match_expression(workload: &Value, expression: &str) -> Result<Option<Value>, ExpressionError> {
    if expression.trim().is_empty() {
        return Ok(None);
    }

    let matched = match Query::parse(expression)?.run(workload) {
        None | Some(Value::Null) | Some(Value::Bool(false)) => None,
        Some(Value::Array(items)) => items.into_iter().next(),
        Some(Value::Object(map)) if map.is_empty() => None,
        Some(other) => Some(other),
    };
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SUCCESS: &str = r#"status.conditions.#(type=="Complete")#|#(status=="True")#"#;
    const FAILURE: &str = r#"status.conditions.#(type=="Failed")#|#(status=="True")#"#;

    fn job(conditions: Value) -> Value {
        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": "trial-1"},
            "status": {"conditions": conditions}
        })
    }

    #[test]
    fn test_failed_job_reports_reason_and_message() {
        let doc = job(json!([{
            "type": "Failed", "status": "True",
            "reason": "BackoffLimitExceeded", "message": "Job has reached the specified backoff limit"
        }]));
        let status = evaluate(&doc, FAILURE, SUCCESS, true, true).unwrap().unwrap();
        assert_eq!(status.condition, JobCondition::Failed);
        assert_eq!(status.reason, "BackoffLimitExceeded");
        assert_eq!(status.message, "Job has reached the specified backoff limit");
    }

    #[test]
    fn test_succeeded_job_tolerates_missing_fields() {
        let doc = job(json!([{"type": "Complete", "status": "True"}]));
        let status = evaluate(&doc, FAILURE, SUCCESS, true, true).unwrap().unwrap();
        assert_eq!(status.condition, JobCondition::Succeeded);
        assert_eq!(status.reason, "");
        assert_eq!(status.message, "");
    }

    #[test]
    fn test_failure_wins_when_both_match() {
        let doc = job(json!([
            {"type": "Complete", "status": "True", "reason": "A"},
            {"type": "Failed", "status": "True", "reason": "B"}
        ]));
        let status = evaluate(&doc, FAILURE, SUCCESS, false, true).unwrap().unwrap();
        assert_eq!(status.condition, JobCondition::Failed);
        assert_eq!(status.reason, "B");
    }

    #[test]
    fn test_running_only_when_not_yet_running_and_created() {
        let doc = job(json!([]));
        assert_eq!(
            evaluate(&doc, FAILURE, SUCCESS, false, true).unwrap(),
            Some(TrialJobStatus::running())
        );
        assert_eq!(evaluate(&doc, FAILURE, SUCCESS, true, true).unwrap(), None);
        assert_eq!(evaluate(&doc, FAILURE, SUCCESS, false, false).unwrap(), None);
    }

    #[test]
    fn test_false_condition_is_not_a_match() {
        let doc = job(json!([{"type": "Failed", "status": "False"}]));
        assert_eq!(evaluate(&doc, FAILURE, SUCCESS, true, true).unwrap(), None);
    }

    #[test]
    fn test_scalar_match_and_empty_expression() {
        let doc = json!({"status": {"phase": "Completed", "failed": false}});
        let status = evaluate(&doc, "status.failed", "status.phase", true, true)
            .unwrap()
            .unwrap();
        assert_eq!(status.condition, JobCondition::Succeeded);

        assert_eq!(evaluate(&doc, "", "", true, true).unwrap(), None);
    }

    #[test]
    fn test_malformed_expression_is_error() {
        let doc = job(json!([]));
        assert!(evaluate(&doc, "status.#(type==", SUCCESS, false, true).is_err());
    }
}
