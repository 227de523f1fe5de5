//! Common types for the fleet orchestrator: CRDs, errors, retry, events and telemetry

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod fanout;
pub mod key;
pub mod kube_utils;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use error::Error;
pub use key::ObjectKey;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label carrying the name of the cluster a per-cluster child belongs to
pub const CLUSTER_NAME_LABEL: &str = "fleet.io/cluster-name";

/// Label carrying the owning application's name
pub const APP_LABEL: &str = "app";

/// Label carrying the availability zone of the cluster a child runs in
pub const ZONE_LABEL: &str = "fleet.io/available-zone";

/// Zone value stamped when a topology cluster declares no zone
pub const NO_ZONE: &str = "null";

/// Finalizer held by AppSets until per-cluster children are gone
pub const FINALIZER: &str = "fleet.io/finalizer";

/// Annotation holding the last-applied configuration of a child
pub const LAST_APPLIED_ANNOTATION: &str = "fleet.io/last-applied";

/// Annotation enabling the autoscaler: `{"enable":true,"min_replicas":2,"max_replicas":6}`
pub const HPA_ANNOTATION: &str = "autoscaling.fleet.io/hpa";

/// Annotation carrying explicit autoscaler metrics
pub const HPA_METRICS_ANNOTATION: &str = "autoscaling.fleet.io/metrics";

/// Annotation that defers deletion of orphans until the AppSet is Running.
/// Without it, orphans are deleted earlier once their zone allows.
pub const WAIT_ALL_READY_ANNOTATION: &str = "fleet.io/delete-unexpected-wait-all-ready";

/// Field manager / event reporter name
pub const CONTROLLER_NAME: &str = "fleet-operator";
