//! Client for the observation-log manager
//!
//! The manager stores the metric samples reported by metrics collectors.
//! The controller reads them once a trial's workload finishes and deletes them
//! when the Trial is deleted (finalizer-gated).

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Manager HTTP error: {0}")]
    HttpError(String),

    #[error("Manager returned status {status} for {operation}")]
    UnexpectedStatus { operation: &'static str, status: u16 },

    #[error("Failed to parse manager response: {0}")]
    ParseError(String),
}

/// One reported metric sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricLog {
    pub metric_name: String,
    pub value: String,
    /// RFC3339 timestamp as reported by the collector
    pub timestamp: String,
}

/// Observation-log operations the controller depends on
///
/// Production code uses `HttpManagerClient`; tests use `MockObservationStore`.
#[async_trait]
pub trait ObservationStore: Send + Sync {
    /// Samples of one metric for a trial. An empty list means "nothing reported yet".
    async fn get_observation_log(
        &self,
        trial_name: &str,
        metric_name: &str,
    ) -> Result<Vec<MetricLog>, ManagerError>;

    /// Delete every sample of a trial. Deleting absent logs is not an error.
    async fn delete_observation_log(&self, trial_name: &str) -> Result<(), ManagerError>;
}

#[derive(Debug, Deserialize)]
struct ObservationLogResponse {
    #[serde(rename = "metricLogs", default)]
    metric_logs: Vec<MetricLogEntry>,
}

#[derive(Debug, Deserialize)]
struct MetricLogEntry {
    #[serde(rename = "timeStamp", default)]
    time_stamp: String,
    metric: MetricEntry,
}

#[derive(Debug, Deserialize)]
struct MetricEntry {
    name: String,
    value: String,
}

fn parse_observation_log(body: &str) -> Result<Vec<MetricLog>, ManagerError> {
    let response: ObservationLogResponse = serde_json::from_str(body)
        .map_err(|e| ManagerError::ParseError(format!("Invalid JSON: {}", e)))?;

    Ok(response
        .metric_logs
        .into_iter()
        .map(|entry| MetricLog {
            metric_name: entry.metric.name,
            value: entry.metric.value,
            timestamp: entry.time_stamp,
        })
        .collect())
}

/// Manager client speaking JSON over HTTP
///
/// - `GET  {address}/v1/observation-logs/{trial}?metricName={metric}`
/// - `DELETE {address}/v1/observation-logs/{trial}`
pub struct HttpManagerClient {
    address: String,
    http: reqwest::Client,
}

impl HttpManagerClient {
    pub fn new(address: String, timeout: Duration) -> Result<Self, ManagerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ManagerError::HttpError(e.to_string()))?;
        Ok(HttpManagerClient {
            address: address.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn log_url(&self, trial_name: &str) -> String {
        format!("{}/v1/observation-logs/{}", self.address, trial_name)
    }
}

#[async_trait]
impl ObservationStore for HttpManagerClient {
    async fn get_observation_log(
        &self,
        trial_name: &str,
        metric_name: &str,
    ) -> Result<Vec<MetricLog>, ManagerError> {
        let response = self
            .http
            .get(self.log_url(trial_name))
            .query(&[("metricName", metric_name)])
            .send()
            .await
            .map_err(|e| ManagerError::HttpError(format!("GET observation log failed: {}", e)))?;

        // Nothing stored for this trial yet
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(ManagerError::UnexpectedStatus {
                operation: "GetObservationLog",
                status: response.status().as_u16(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| ManagerError::HttpError(e.to_string()))?;
        let logs = parse_observation_log(&body)?;
        debug!(trial = %trial_name, metric = %metric_name, samples = logs.len(), "Fetched observation log");
        Ok(logs)
    }

    async fn delete_observation_log(&self, trial_name: &str) -> Result<(), ManagerError> {
        let response = self
            .http
            .delete(self.log_url(trial_name))
            .send()
            .await
            .map_err(|e| {
                ManagerError::HttpError(format!("DELETE observation log failed: {}", e))
            })?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(ManagerError::UnexpectedStatus {
                operation: "DeleteObservationLog",
                status: status.as_u16(),
            })
        }
    }
}

/// In-memory manager for tests: per-trial samples plus a call log
#[cfg(test)]
#[derive(Default)]
pub struct MockObservationStore {
    logs: std::sync::Mutex<std::collections::HashMap<String, Vec<MetricLog>>>,
    calls: std::sync::Mutex<Vec<String>>,
    fail_delete: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockObservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, trial_name: &str, metric_name: &str, value: &str, timestamp: &str) {
        self.logs
            .lock()
            .unwrap()
            .entry(trial_name.to_string())
            .or_default()
            .push(MetricLog {
                metric_name: metric_name.to_string(),
                value: value.to_string(),
                timestamp: timestamp.to_string(),
            });
    }

    pub fn set_fail_delete(&self, fail: bool) {
        self.fail_delete
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Calls in order, e.g. `"get:trial-1:loss"`, `"delete:trial-1"`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait]
impl ObservationStore for MockObservationStore {
    async fn get_observation_log(
        &self,
        trial_name: &str,
        metric_name: &str,
    ) -> Result<Vec<MetricLog>, ManagerError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("get:{}:{}", trial_name, metric_name));
        Ok(self
            .logs
            .lock()
            .unwrap()
            .get(trial_name)
            .map(|logs| {
                logs.iter()
                    .filter(|l| l.metric_name == metric_name)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_observation_log(&self, trial_name: &str) -> Result<(), ManagerError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("delete:{}", trial_name));
        if self.fail_delete.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ManagerError::UnexpectedStatus {
                operation: "DeleteObservationLog",
                status: 503,
            });
        }
        self.logs.lock().unwrap().remove(trial_name);
        Ok(())
    }
}
