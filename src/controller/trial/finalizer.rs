use super::ReconcileError;
use crate::controller::manager::ObservationStore;
use crate::crd::trial::Trial;
use kube::{Resource, ResourceExt};
use tracing::info;

/// Finalizer guarding deletion of a Trial's observation log
pub const CLEANUP_FINALIZER: &str = "update-prometheus-metrics";

pub fn is_deleting(trial: &Trial) -> bool {
    trial.meta().deletion_timestamp.is_some()
}

pub fn has_cleanup_finalizer(trial: &Trial) -> bool {
    trial.finalizers().iter().any(|f| f == CLEANUP_FINALIZER)
}

/// Compute the finalizer list to write, if any
///
/// - Live Trial without the token: token appended.
/// - Deleting Trial with the token: the observation log is deleted first, then
///   the token is stripped. A failed delete aborts with the token still present.
/// - Otherwise `None`.
pub async fn needs_update(
    trial: &Trial,
    manager: &dyn ObservationStore,
) -> Result<Option<Vec<String>>, ReconcileError> {
    let finalizers = trial.finalizers().to_vec();

    match (is_deleting(trial), has_cleanup_finalizer(trial)) {
        (false, false) => {
            let mut updated = finalizers;
            updated.push(CLEANUP_FINALIZER.to_string());
            Ok(Some(updated))
        }
        (true, true) => {
            let name = trial.name_any();
            manager.delete_observation_log(&name).await?;
            info!(trial = ?name, "Observation log deleted, releasing finalizer");
            Ok(Some(
                finalizers
                    .into_iter()
                    .filter(|f| f != CLEANUP_FINALIZER)
                    .collect(),
            ))
        }
        _ => Ok(None),
    }
}
