//! Controller configuration, read once from the environment at startup

use crate::controller::registry::{parse_kind_list, RegistryError, WorkloadKind};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_WORKLOAD_KINDS: &str = "Job.v1.batch";
pub const DEFAULT_MANAGER_ADDRESS: &str = "http://katib-db-manager.kubeflow:6789";
pub const DEFAULT_MANAGER_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HEALTH_PORT: u16 = 8080;
pub const DEFAULT_GAUGE_REFRESH: Duration = Duration::from_secs(30);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0}")]
    WorkloadKind(#[from] RegistryError),

    #[error("Invalid value {value:?} for {variable}: expected {expected}")]
    InvalidValue {
        variable: &'static str,
        value: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Workload kinds a Trial may run (`TRIALCTL_WORKLOAD_KINDS`)
    pub workload_kinds: Vec<WorkloadKind>,
    /// Observation-log manager base URL (`TRIALCTL_MANAGER_ADDRESS`)
    pub manager_address: String,
    /// Per-request timeout for manager calls (`TRIALCTL_MANAGER_TIMEOUT_SECONDS`)
    pub manager_timeout: Duration,
    /// Port for /healthz, /readyz and /metrics (`TRIALCTL_HEALTH_PORT`)
    pub health_port: u16,
    /// Namespace to watch; all namespaces when None (`TRIALCTL_WATCH_NAMESPACE`)
    pub watch_namespace: Option<String>,
    /// Interval for recomputing the trial_current gauge (`TRIALCTL_GAUGE_REFRESH_SECONDS`)
    pub gauge_refresh: Duration,
    /// Max concurrent reconciles, 0 = unbounded (`TRIALCTL_CONCURRENCY`)
    pub concurrency: u16,
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from any variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let workload_kinds = parse_kind_list(
            &get("TRIALCTL_WORKLOAD_KINDS").unwrap_or_else(|| DEFAULT_WORKLOAD_KINDS.to_string()),
        )?;

        let manager_timeout = match get("TRIALCTL_MANAGER_TIMEOUT_SECONDS") {
            Some(raw) => Duration::from_secs(parse_number(
                "TRIALCTL_MANAGER_TIMEOUT_SECONDS",
                &raw,
            )?),
            None => DEFAULT_MANAGER_TIMEOUT,
        };

        let health_port = match get("TRIALCTL_HEALTH_PORT") {
            Some(raw) => parse_number("TRIALCTL_HEALTH_PORT", &raw)?,
            None => DEFAULT_HEALTH_PORT,
        };

        let gauge_refresh = match get("TRIALCTL_GAUGE_REFRESH_SECONDS") {
            Some(raw) => {
                let secs: u64 = parse_number("TRIALCTL_GAUGE_REFRESH_SECONDS", &raw)?;
                if secs == 0 {
                    return Err(ConfigError::InvalidValue {
                        variable: "TRIALCTL_GAUGE_REFRESH_SECONDS",
                        value: raw,
                        expected: "a positive number of seconds",
                    });
                }
                Duration::from_secs(secs)
            }
            None => DEFAULT_GAUGE_REFRESH,
        };

        let concurrency = match get("TRIALCTL_CONCURRENCY") {
            Some(raw) => parse_number("TRIALCTL_CONCURRENCY", &raw)?,
            None => 0,
        };

        Ok(ControllerConfig {
            workload_kinds,
            manager_address: get("TRIALCTL_MANAGER_ADDRESS")
                .unwrap_or_else(|| DEFAULT_MANAGER_ADDRESS.to_string()),
            manager_timeout,
            health_port,
            watch_namespace: get("TRIALCTL_WATCH_NAMESPACE"),
            gauge_refresh,
            concurrency,
        })
    }
}

fn parse_number<T: std::str::FromStr>(
    variable: &'static str,
    raw: &str,
) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        variable,
        value: raw.to_string(),
        expected: "a non-negative integer",
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[path = "config_test.rs"]
mod tests;
