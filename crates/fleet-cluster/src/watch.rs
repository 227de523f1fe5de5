//! Watch predicates and key transforms.
//!
//! A registration turns raw create/update/delete notifications into at most
//! one queued key: every predicate must accept the event, then the transform
//! picks the key (or declines).

use std::collections::BTreeSet;
use std::sync::Arc;

use fleet_common::{ObjectKey, APP_LABEL, CLUSTER_NAME_LABEL};
use fleet_queue::WorkQueue;
use kube::api::DynamicObject;
use kube::ResourceExt;
use tracing::trace;

/// Maps an object to the key that should be reconciled, if any
pub type Transform = Arc<dyn Fn(&DynamicObject) -> Option<ObjectKey> + Send + Sync>;

/// Filters watch notifications before they reach the transform.
///
/// Each hook defaults to [`Predicate::generic`], which defaults to accept.
pub trait Predicate: Send + Sync {
    /// Object appeared
    fn create(&self, obj: &DynamicObject) -> bool {
        self.generic(obj)
    }

    /// Object changed from `old` to `new`
    fn update(&self, _old: &DynamicObject, new: &DynamicObject) -> bool {
        self.generic(new)
    }

    /// Object disappeared
    fn delete(&self, obj: &DynamicObject) -> bool {
        self.generic(obj)
    }

    /// Fallback for all of the above
    fn generic(&self, _obj: &DynamicObject) -> bool {
        true
    }
}

/// Accepts objects in one namespace, or every namespace for `*`
#[derive(Clone, Debug)]
pub struct NamespacePredicate {
    namespace: String,
}

impl NamespacePredicate {
    /// Match `namespace` case-insensitively; `*` matches all
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }
}

impl Predicate for NamespacePredicate {
    fn generic(&self, obj: &DynamicObject) -> bool {
        self.namespace == "*"
            || obj
                .namespace()
                .is_some_and(|ns| ns.eq_ignore_ascii_case(&self.namespace))
    }
}

/// Accepts objects carrying every one of the given label keys
#[derive(Clone, Debug)]
pub struct LabelsKeyPredicate {
    keys: BTreeSet<String>,
}

impl LabelsKeyPredicate {
    /// Require all of `keys`
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl Predicate for LabelsKeyPredicate {
    fn generic(&self, obj: &DynamicObject) -> bool {
        let labels = obj.labels();
        self.keys.iter().all(|k| labels.contains_key(k))
    }
}

/// Passes updates that touch the spec (generation), labels, annotations or
/// deletion state; status-only updates are dropped.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpecOrMetaChanged;

impl Predicate for SpecOrMetaChanged {
    fn update(&self, old: &DynamicObject, new: &DynamicObject) -> bool {
        old.metadata.generation != new.metadata.generation
            || old.metadata.labels != new.metadata.labels
            || old.metadata.annotations != new.metadata.annotations
            || old.metadata.deletion_timestamp != new.metadata.deletion_timestamp
            || old.metadata.finalizers != new.metadata.finalizers
    }
}

/// Key of the object itself
pub fn default_transform() -> Transform {
    Arc::new(|obj: &DynamicObject| {
        let name = obj.metadata.name.clone()?;
        Some(ObjectKey::new(obj.namespace().unwrap_or_default(), name))
    })
}

/// Key of the owning AdvDeployment, recovered from the child's labels.
///
/// The child must carry the cluster-name label and a non-empty app label;
/// the owner lives in the child's namespace under the app label's value.
pub fn owner_transform() -> Transform {
    Arc::new(|obj: &DynamicObject| {
        let labels = obj.labels();
        labels.get(CLUSTER_NAME_LABEL)?;
        let app = labels.get(APP_LABEL).filter(|a| !a.is_empty())?;
        Some(ObjectKey::new(obj.namespace().unwrap_or_default(), app.clone()))
    })
}

/// One handler bound to a resource type on one cluster
pub struct WatchRegistration {
    queue: WorkQueue,
    transform: Transform,
    predicates: Vec<Arc<dyn Predicate>>,
}

impl WatchRegistration {
    /// Bind a queue, transform and predicate chain
    pub fn new(queue: WorkQueue, transform: Transform, predicates: Vec<Arc<dyn Predicate>>) -> Self {
        Self {
            queue,
            transform,
            predicates,
        }
    }

    pub(crate) fn on_create(&self, obj: &DynamicObject) {
        if self.predicates.iter().all(|p| p.create(obj)) {
            self.enqueue(obj, "create");
        }
    }

    pub(crate) fn on_update(&self, old: &DynamicObject, new: &DynamicObject) {
        if self.predicates.iter().all(|p| p.update(old, new)) {
            self.enqueue(new, "update");
        }
    }

    pub(crate) fn on_delete(&self, obj: &DynamicObject) {
        if self.predicates.iter().all(|p| p.delete(obj)) {
            self.enqueue(obj, "delete");
        }
    }

    fn enqueue(&self, obj: &DynamicObject, event: &'static str) {
        if let Some(key) = (self.transform)(obj) {
            trace!(queue = %self.queue.name(), key = %key, event, "watch event queued");
            self.queue.add(key);
        }
    }
}
