//! Trial custom resource and its condition ledger

pub mod conditions;
pub mod trial;

#[cfg(test)]
#[path = "trial_test.rs"]
mod trial_tests;
