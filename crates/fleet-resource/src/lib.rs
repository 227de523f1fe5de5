//! Resource reconciler: converge one desired object on one cluster.
//!
//! The diff is a three-way JSON merge patch between the last-applied
//! configuration recorded on the live object, the desired object and the
//! live object, after field-ignoring rules and empty-value pruning.

#![deny(missing_docs)]

pub mod annotation;
pub mod ignore;
pub mod patch;
pub mod prune;
pub mod reconcile;

pub use ignore::IgnoreRule;
pub use patch::{calculate, PatchResult};
pub use reconcile::{reconcile, DesiredState, Reconcilable, ReconcileOption};
