//! Trial controller for hyperparameter tuning
//!
//! Drives `Trial` resources (`kubeflow.org/v1beta1`) through their lifecycle:
//! one owned workload per Trial, status classified from the workload with
//! operator-authored condition expressions, and metrics folded in from the
//! observation-log manager once the workload finishes.

pub mod config;
pub mod controller;
pub mod crd;
pub mod server;
