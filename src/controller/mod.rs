pub mod clock;
pub mod cluster;
pub mod events;
pub mod expression;
pub mod manager;
pub mod registry;
pub mod trial;

pub use trial::{error_policy, reconcile, Context, ReconcileError};
