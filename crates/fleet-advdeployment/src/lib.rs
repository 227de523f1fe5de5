//! Single-cluster AdvDeployment pipeline.
//!
//! Renders the AdvDeployment's chart once per pod set, converges the
//! rendered children and their autoscalers on the cluster, and aggregates
//! the workloads back into the AdvDeployment status.

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod convert;
pub mod hpa;
pub mod render;
pub mod status;

pub use config::{AdvConfig, REQUEUE_AFTER};
pub use controller::AdvDeploymentReconciler;
pub use convert::RenderedObject;
pub use render::{ManifestRenderer, Renderer};
pub use status::{recalculate, Recalculated};
