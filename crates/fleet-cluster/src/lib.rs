//! Multi-cluster connectivity for the fleet orchestrator.
//!
//! A [`ClusterHandle`] owns one connection: typed CRUD bounded by a per-call
//! timeout, cache-backed watches feeding reconcile queues, and a health
//! probe. The [`FleetRegistry`] keeps the live set of handles in step with a
//! [`ClusterConfigSource`].

#![deny(missing_docs)]

mod cache;
pub mod descriptor;
pub mod factory;
pub mod handle;
pub mod registry;
pub mod source;
pub mod store;
pub mod watch;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cache::IndexFn;
pub use descriptor::{ClusterDescriptor, CredentialType};
pub use factory::{HandleFactory, KubeHandleFactory};
pub use handle::{ClusterHandle, HandleOptions, Object};
pub use registry::{BeforeStartHook, FleetRegistry, RegistryOptions};
pub use source::{ClusterConfigSource, ConfigMapConfigSource, PathConfigSource};
pub use store::{KubeObjectStore, ListSelector, ObjectStore, WatchEvent};
pub use watch::{
    default_transform, owner_transform, LabelsKeyPredicate, NamespacePredicate, Predicate,
    SpecOrMetaChanged, Transform, WatchRegistration,
};
