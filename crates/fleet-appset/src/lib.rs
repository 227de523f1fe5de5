//! Fleet-level AppSet pipeline.
//!
//! Expands each AppSet into one AdvDeployment per topology cluster, folds
//! the children's statuses back into the AppSet, and removes children from
//! clusters the topology no longer names.

#![deny(missing_docs)]

pub mod controller;
pub mod expand;
pub mod status;
pub mod zone;

pub use controller::{AppSetReconciler, REQUEUE_AFTER, REQUEUE_AFTER_ERROR};
pub use status::{aggregate, warn_events, FleetStatus};
