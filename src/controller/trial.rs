pub mod finalizer;
pub mod observation;
pub mod reconcile;
pub mod status;
pub mod workload;

pub use reconcile::*;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "trial_test.rs"]
mod tests;
