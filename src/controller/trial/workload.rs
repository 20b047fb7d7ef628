use super::{Context, ReconcileError};
use crate::controller::events::{actions, reasons};
use crate::crd::trial::Trial;
use kube::api::DynamicObject;
use kube::core::ApiResource;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::info;

/// Build the workload a Trial should own from its `runSpec`
///
/// The name defaults to the Trial's name, the namespace is always the
/// Trial's, and the Trial becomes the controlling owner.
pub fn desired_workload(trial: &Trial) -> Result<DynamicObject, ReconcileError> {
    let namespace = trial.namespace().ok_or(ReconcileError::MissingNamespace)?;

    let mut template = trial.spec.run_spec.clone();
    if let Some(fields) = template.as_object_mut() {
        fields
            .entry("metadata")
            .or_insert_with(|| serde_json::json!({}));
    }
    let mut workload: DynamicObject = serde_json::from_value(template)
        .map_err(|e| ReconcileError::InvalidTemplate(e.to_string()))?;

    let has_type = workload
        .types
        .as_ref()
        .map(|t| !t.api_version.is_empty() && !t.kind.is_empty())
        .unwrap_or(false);
    if !has_type {
        return Err(ReconcileError::InvalidTemplate(
            "runSpec must set apiVersion and kind".to_string(),
        ));
    }

    if workload.metadata.name.as_deref().unwrap_or_default().is_empty() {
        workload.metadata.name = Some(trial.name_any());
    }
    workload.metadata.namespace = Some(namespace);

    let owner = trial.controller_owner_ref(&()).ok_or_else(|| {
        ReconcileError::OwnerReference(format!("Trial {} has no uid", trial.name_any()))
    })?;
    let mut owners = workload.metadata.owner_references.take().unwrap_or_default();
    owners.retain(|o| o.controller != Some(true));
    owners.push(owner);
    workload.metadata.owner_references = Some(owners);

    Ok(workload)
}

/// Resolve the registered resource for a workload's apiVersion and kind
pub fn workload_resource(
    workload: &DynamicObject,
    ctx: &Context,
) -> Result<ApiResource, ReconcileError> {
    let (api_version, kind) = workload
        .types
        .as_ref()
        .map(|t| (t.api_version.as_str(), t.kind.as_str()))
        .unwrap_or_default();
    ctx.registry
        .resolve(api_version, kind)
        .cloned()
        .ok_or_else(|| ReconcileError::UnknownWorkloadKind(format!("{}/{}", api_version, kind)))
}

/// Whether a terminal Trial still needs its workload for a final metrics sync
fn awaiting_final_metrics(trial: &Trial) -> bool {
    trial.is_early_stopped() && !trial.has_observation()
}

/// Bring the workload in line with the Trial and return the current one
///
/// - Missing and Trial not terminal: create it (treated as current this tick).
/// - Present, Trial terminal and not retained: delete it (no current workload).
/// - Otherwise the existing workload is current.
pub async fn reconcile_workload(
    trial: &Trial,
    desired: &DynamicObject,
    resource: &ApiResource,
    ctx: &Context,
) -> Result<Option<DynamicObject>, ReconcileError> {
    let namespace = desired.namespace().unwrap_or_default();
    let name = desired.name_any();

    let existing = ctx
        .cluster
        .get_workload(resource, &namespace, &name)
        .await?
        // A workload already being torn down counts as gone
        .filter(|w| w.metadata.deletion_timestamp.is_none());

    match existing {
        None if trial.is_completed() => Ok(None),
        None => {
            info!(trial = ?trial.name_any(), kind = %resource.kind, workload = %name, "Creating workload");
            let created = ctx.cluster.create_workload(resource, desired).await?;
            ctx.events
                .publish(
                    &trial.object_ref(&()),
                    EventType::Normal,
                    reasons::JOB_CREATED,
                    actions::CREATE,
                    Some(format!("{} {} has been created", resource.kind, name)),
                )
                .await;
            Ok(Some(created))
        }
        Some(_) if trial.is_completed() && !trial.spec.retain_run && !awaiting_final_metrics(trial) => {
            info!(trial = ?trial.name_any(), kind = %resource.kind, workload = %name, "Deleting workload of completed trial");
            ctx.cluster
                .delete_workload(resource, &namespace, &name)
                .await?;
            ctx.events
                .publish(
                    &trial.object_ref(&()),
                    EventType::Normal,
                    reasons::JOB_DELETED,
                    actions::DELETE,
                    Some(format!("{} {} has been deleted", resource.kind, name)),
                )
                .await;
            Ok(None)
        }
        Some(current) => Ok(Some(current)),
    }
}
