//! Registry of workload kinds a Trial may run
//!
//! Kinds are configured as `Kind.version.group` (core-group kinds as
//! `Kind.version`). At startup each configured kind is looked up through API
//! discovery; kinds whose CRD is not installed are skipped with a warning.

use kube::core::ApiResource;
use kube::discovery::Discovery;
use kube::Client;
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Invalid workload kind {0:?}: expected Kind.version.group")]
    InvalidKind(String),
}

/// One configured workload kind, e.g. `Job.v1.batch` or `TFJob.v1.kubeflow.org`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadKind {
    pub kind: String,
    pub version: String,
    pub group: String,
}

impl WorkloadKind {
    pub fn parse(raw: &str) -> Result<Self, RegistryError> {
        let raw = raw.trim();
        let mut parts = raw.splitn(3, '.');
        let kind = parts.next().unwrap_or_default();
        let version = parts.next().unwrap_or_default();
        let group = parts.next().unwrap_or_default();
        if kind.is_empty() || version.is_empty() {
            return Err(RegistryError::InvalidKind(raw.to_string()));
        }
        Ok(WorkloadKind {
            kind: kind.to_string(),
            version: version.to_string(),
            group: group.to_string(),
        })
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}.{}", self.kind, self.version)
        } else {
            write!(f, "{}.{}.{}", self.kind, self.version, self.group)
        }
    }
}

/// Parse a comma-separated kind list, skipping empty entries
pub fn parse_kind_list(raw: &str) -> Result<Vec<WorkloadKind>, RegistryError> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(WorkloadKind::parse)
        .collect()
}

/// Workload kinds installed in the cluster and watched by the controller
#[derive(Debug, Clone, Default)]
pub struct WorkloadRegistry {
    resources: Vec<ApiResource>,
}

impl WorkloadRegistry {
    pub fn from_resources(resources: Vec<ApiResource>) -> Self {
        WorkloadRegistry { resources }
    }

    /// Resolve configured kinds against the API server
    pub async fn discover(client: &Client, kinds: &[WorkloadKind]) -> Result<Self, kube::Error> {
        let discovery = Discovery::new(client.clone()).run().await?;
        let mut resources = Vec::new();
        for wanted in kinds {
            match find_resource(&discovery, wanted) {
                Some(ar) => {
                    info!(kind = %wanted, plural = %ar.plural, "Watching workload kind");
                    resources.push(ar);
                }
                None => {
                    warn!(kind = %wanted, "Workload kind not installed, skipping");
                }
            }
        }
        Ok(WorkloadRegistry { resources })
    }

    pub fn resources(&self) -> &[ApiResource] {
        &self.resources
    }

    /// Find the registered resource for a workload's apiVersion and kind
    pub fn resolve(&self, api_version: &str, kind: &str) -> Option<&ApiResource> {
        self.resources
            .iter()
            .find(|ar| ar.api_version == api_version && ar.kind == kind)
    }
}

fn find_resource(discovery: &Discovery, wanted: &WorkloadKind) -> Option<ApiResource> {
    discovery
        .groups()
        .filter(|g| g.name() == wanted.group)
        .flat_map(|g| g.versioned_resources(&wanted.version))
        .map(|(ar, _caps)| ar)
        .find(|ar| ar.kind == wanted.kind)
}
