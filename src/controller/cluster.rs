//! Cluster operations used by the Trial reconciler
//!
//! `ClusterClient` is the seam between reconciliation logic and the Kubernetes
//! API: production wires `KubeClusterClient`, tests wire `FakeCluster`.

use crate::crd::trial::Trial;
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::core::ApiResource;
use kube::{Client, ResourceExt};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Optimistic-concurrency failure: the object changed since it was read
    #[error("Conflict writing {0}: object has been modified")]
    Conflict(String),

    #[error("Failed to serialize {0}: {1}")]
    Serialization(String, String),
}

fn classify(error: kube::Error, name: &str) -> ClusterError {
    match error {
        kube::Error::Api(ref ae) if ae.code == 409 => ClusterError::Conflict(name.to_string()),
        other => ClusterError::Kube(other),
    }
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fresh read of a Trial; `None` when it no longer exists
    async fn get_trial(&self, namespace: &str, name: &str) -> Result<Option<Trial>, ClusterError>;

    /// Write the finalizer list, guarded by the Trial's resourceVersion
    async fn replace_trial_finalizers(
        &self,
        trial: &Trial,
        finalizers: Vec<String>,
    ) -> Result<(), ClusterError>;

    /// Write the status subresource, guarded by the Trial's resourceVersion
    async fn replace_trial_status(&self, trial: &Trial) -> Result<(), ClusterError>;

    async fn get_workload(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, ClusterError>;

    /// Create a workload and return the stored object
    async fn create_workload(
        &self,
        resource: &ApiResource,
        workload: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError>;

    /// Foreground-delete a workload. Deleting an absent workload succeeds.
    async fn delete_workload(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError>;
}

pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        KubeClusterClient { client }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_trial(&self, namespace: &str, name: &str) -> Result<Option<Trial>, ClusterError> {
        let api: Api<Trial> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn replace_trial_finalizers(
        &self,
        trial: &Trial,
        finalizers: Vec<String>,
    ) -> Result<(), ClusterError> {
        let name = trial.name_any();
        let api: Api<Trial> =
            Api::namespaced(self.client.clone(), &trial.namespace().unwrap_or_default());
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": trial.resource_version(),
            }
        });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(e, &name))?;
        debug!(trial = ?name, "Finalizers updated");
        Ok(())
    }

    async fn replace_trial_status(&self, trial: &Trial) -> Result<(), ClusterError> {
        let name = trial.name_any();
        let api: Api<Trial> =
            Api::namespaced(self.client.clone(), &trial.namespace().unwrap_or_default());
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": trial.resource_version() },
            "status": trial.status,
        });
        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(e, &name))?;
        debug!(trial = ?name, "Status updated");
        Ok(())
    }

    async fn get_workload(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, ClusterError> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, resource);
        Ok(api.get_opt(name).await?)
    }

    async fn create_workload(
        &self,
        resource: &ApiResource,
        workload: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        let namespace = workload.namespace().unwrap_or_default();
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &namespace, resource);
        Ok(api.create(&PostParams::default(), workload).await?)
    }

    async fn delete_workload(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, resource);
        match api.delete(name, &DeleteParams::foreground()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory cluster for reconciler tests
///
/// Mimics the API server behaviors the reconciler relies on: resourceVersion
/// bumps and conflicts, uid assignment on create, and removal of a deleting
/// Trial once its finalizer list is empty.
#[cfg(test)]
#[derive(Default)]
pub struct FakeCluster {
    state: std::sync::Mutex<FakeState>,
}

#[cfg(test)]
#[derive(Default)]
struct FakeState {
    trials: std::collections::BTreeMap<(String, String), Trial>,
    workloads: std::collections::BTreeMap<(String, String, String), DynamicObject>,
    resource_version: u64,
    calls: Vec<String>,
    conflict_next_status_write: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl FakeState {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn check_version(&self, trial: &Trial) -> Result<(String, String), ClusterError> {
        let key = (trial.namespace().unwrap_or_default(), trial.name_any());
        let stored = self
            .trials
            .get(&key)
            .ok_or_else(|| ClusterError::Conflict(trial.name_any()))?;
        if stored.resource_version() != trial.resource_version() {
            return Err(ClusterError::Conflict(trial.name_any()));
        }
        Ok(key)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a Trial as if created by a client; assigns uid and resourceVersion
    pub fn insert_trial(&self, mut trial: Trial) {
        let mut state = self.state.lock().unwrap();
        if trial.metadata.uid.is_none() {
            trial.metadata.uid = Some(format!("uid-{}", trial.name_any()));
        }
        trial.metadata.resource_version = Some(state.next_version());
        let key = (trial.namespace().unwrap_or_default(), trial.name_any());
        state.trials.insert(key, trial);
    }

    pub fn trial(&self, namespace: &str, name: &str) -> Option<Trial> {
        self.state
            .lock()
            .unwrap()
            .trials
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Mark a stored Trial as deleting, as the API server does for objects with finalizers
    pub fn request_trial_deletion(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        let trial = state
            .trials
            .get_mut(&(namespace.to_string(), name.to_string()))
            .unwrap();
        trial.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        trial.metadata.resource_version = Some(version);
    }

    /// Patch a workload's status as its own controller would
    pub fn set_workload_status(&self, namespace: &str, name: &str, status: serde_json::Value) {
        let mut state = self.state.lock().unwrap();
        let workload = state
            .workloads
            .iter_mut()
            .find(|((_, ns, n), _)| ns == namespace && n == name)
            .map(|(_, w)| w)
            .unwrap();
        workload.data["status"] = status;
    }

    pub fn workload(&self, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.state
            .lock()
            .unwrap()
            .workloads
            .iter()
            .find(|((_, ns, n), _)| ns == namespace && n == name)
            .map(|(_, w)| w.clone())
    }

    /// Fail the next status write with a conflict
    pub fn conflict_next_status_write(&self) {
        self.state.lock().unwrap().conflict_next_status_write = true;
    }

    /// Mutating calls in order, e.g. `"finalizers:t"`, `"status:t"`, `"create:Job:t"`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_trial(&self, namespace: &str, name: &str) -> Result<Option<Trial>, ClusterError> {
        Ok(self.trial(namespace, name))
    }

    async fn replace_trial_finalizers(
        &self,
        trial: &Trial,
        finalizers: Vec<String>,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        let key = state.check_version(trial)?;
        state.calls.push(format!("finalizers:{}", trial.name_any()));
        let version = state.next_version();
        let stored = state.trials.get_mut(&key).unwrap();
        stored.metadata.finalizers = if finalizers.is_empty() {
            None
        } else {
            Some(finalizers)
        };
        stored.metadata.resource_version = Some(version);
        if stored.metadata.deletion_timestamp.is_some() && stored.finalizers().is_empty() {
            state.trials.remove(&key);
        }
        Ok(())
    }

    async fn replace_trial_status(&self, trial: &Trial) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.conflict_next_status_write) {
            return Err(ClusterError::Conflict(trial.name_any()));
        }
        let key = state.check_version(trial)?;
        state.calls.push(format!("status:{}", trial.name_any()));
        let version = state.next_version();
        let stored = state.trials.get_mut(&key).unwrap();
        stored.status = trial.status.clone();
        stored.metadata.resource_version = Some(version);
        Ok(())
    }

    async fn get_workload(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, ClusterError> {
        let key = (
            resource.kind.clone(),
            namespace.to_string(),
            name.to_string(),
        );
        Ok(self.state.lock().unwrap().workloads.get(&key).cloned())
    }

    async fn create_workload(
        &self,
        resource: &ApiResource,
        workload: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        let mut state = self.state.lock().unwrap();
        let name = workload.name_any();
        let key = (
            resource.kind.clone(),
            workload.namespace().unwrap_or_default(),
            name.clone(),
        );
        if state.workloads.contains_key(&key) {
            return Err(ClusterError::Conflict(name));
        }
        state.calls.push(format!("create:{}:{}", resource.kind, name));
        let mut created = workload.clone();
        created.metadata.uid = Some(format!("uid-{}-{}", resource.kind, name));
        created.metadata.resource_version = Some(state.next_version());
        state.workloads.insert(key, created.clone());
        Ok(created)
    }

    async fn delete_workload(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("delete:{}:{}", resource.kind, name));
        state.workloads.remove(&(
            resource.kind.clone(),
            namespace.to_string(),
            name.to_string(),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::trial::TrialSpec;

    fn trial(name: &str) -> Trial {
        let spec: TrialSpec = serde_json::from_value(serde_json::json!({
            "objective": {"objectiveMetricName": "loss"},
            "runSpec": {"apiVersion": "batch/v1", "kind": "Job"}
        }))
        .unwrap();
        let mut trial = Trial::new(name, spec);
        trial.metadata.namespace = Some("default".to_string());
        trial
    }

    #[tokio::test]
    async fn test_fake_rejects_stale_writes() {
        let cluster = FakeCluster::new();
        cluster.insert_trial(trial("t"));
        let stale = cluster.trial("default", "t").unwrap();

        cluster
            .replace_trial_finalizers(&stale, vec!["x".to_string()])
            .await
            .unwrap();
        let result = cluster.replace_trial_status(&stale).await;
        assert!(matches!(result, Err(ClusterError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_fake_removes_deleting_trial_without_finalizers() {
        let cluster = FakeCluster::new();
        cluster.insert_trial(trial("t"));
        cluster.request_trial_deletion("default", "t");
        let current = cluster.trial("default", "t").unwrap();

        cluster
            .replace_trial_finalizers(&current, Vec::new())
            .await
            .unwrap();
        assert!(cluster.trial("default", "t").is_none());
    }
}
