//! Per-resource informer cache with secondary field indexes

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use fleet_common::{Error, ObjectKey, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::store::WatchEvent;
use crate::watch::WatchRegistration;

/// Extracts the index values of an object for one field
pub type IndexFn = Arc<dyn Fn(&DynamicObject) -> Vec<String> + Send + Sync>;

/// Identity of a resource type inside one handle
pub(crate) fn resource_id(ar: &ApiResource) -> String {
    format!("{}/{}", ar.api_version, ar.kind)
}

pub(crate) struct ResourceCache {
    pub(crate) resource: ApiResource,
    objects: DashMap<ObjectKey, DynamicObject>,
    indexers: RwLock<HashMap<String, IndexFn>>,
    handlers: RwLock<Vec<Arc<WatchRegistration>>>,
    relisting: Mutex<Option<HashSet<ObjectKey>>>,
    running: AtomicBool,
}

impl ResourceCache {
    pub(crate) fn new(resource: ApiResource) -> Self {
        Self {
            resource,
            objects: DashMap::new(),
            indexers: RwLock::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
            relisting: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub(crate) fn add_handler(&self, handler: Arc<WatchRegistration>) {
        self.handlers.write().push(handler);
    }

    pub(crate) fn add_indexer(&self, field: &str, extractor: IndexFn) -> Result<()> {
        let mut indexers = self.indexers.write();
        if indexers.contains_key(field) {
            return Err(Error::configuration(format!(
                "index {} already registered for {}",
                field, self.resource.kind
            )));
        }
        indexers.insert(field.to_string(), extractor);
        Ok(())
    }

    /// Claim the right to run the informer; false if already running
    pub(crate) fn claim(&self) -> bool {
        !self.running.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn by_index(&self, field: &str, value: &str) -> Result<Vec<DynamicObject>> {
        let indexers = self.indexers.read();
        let extractor = indexers.get(field).ok_or_else(|| {
            Error::configuration(format!(
                "no index {} registered for {}",
                field, self.resource.kind
            ))
        })?;
        let mut matched: Vec<DynamicObject> = self
            .objects
            .iter()
            .filter(|entry| extractor(entry.value()).iter().any(|v| v == value))
            .map(|entry| entry.value().clone())
            .collect();
        matched.sort_by_key(ObjectKey::of);
        Ok(matched)
    }

    pub(crate) fn len(&self) -> usize {
        self.objects.len()
    }

    pub(crate) async fn consume(
        &self,
        mut stream: BoxStream<'static, Result<WatchEvent>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(e)) => warn!(kind = %self.resource.kind, error = %e, "watch error"),
                    None => {
                        debug!(kind = %self.resource.kind, "watch stream ended");
                        break;
                    }
                }
            }
        }
    }

    pub(crate) fn apply(&self, event: WatchEvent) {
        let handlers = self.handlers.read().clone();
        match event {
            WatchEvent::Restarted => {
                *self.relisting.lock() = Some(HashSet::new());
            }
            WatchEvent::Applied(obj) => {
                let key = ObjectKey::of(&obj);
                if let Some(seen) = self.relisting.lock().as_mut() {
                    seen.insert(key.clone());
                }
                let old = self.objects.insert(key, obj.clone());
                for h in &handlers {
                    match &old {
                        Some(old) => h.on_update(old, &obj),
                        None => h.on_create(&obj),
                    }
                }
            }
            WatchEvent::Deleted(obj) => {
                self.objects.remove(&ObjectKey::of(&obj));
                for h in &handlers {
                    h.on_delete(&obj);
                }
            }
            WatchEvent::Synced => {
                let Some(seen) = self.relisting.lock().take() else {
                    return;
                };
                let stale: Vec<ObjectKey> = self
                    .objects
                    .iter()
                    .filter(|e| !seen.contains(e.key()))
                    .map(|e| e.key().clone())
                    .collect();
                for key in stale {
                    if let Some((_, obj)) = self.objects.remove(&key) {
                        for h in &handlers {
                            h.on_delete(&obj);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::default_transform;
    use fleet_queue::WorkQueue;

    fn ar() -> ApiResource {
        ApiResource {
            group: "apps".into(),
            version: "v1".into(),
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            plural: "deployments".into(),
        }
    }

    fn deploy(name: &str, app: &str) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &ar()).within("prod");
        obj.metadata.labels = Some([("app".to_string(), app.to_string())].into());
        obj
    }

    fn app_index() -> IndexFn {
        Arc::new(|o: &DynamicObject| {
            o.metadata
                .labels
                .as_ref()
                .and_then(|l| l.get("app").cloned())
                .into_iter()
                .collect()
        })
    }

    #[tokio::test]
    async fn apply_distinguishes_create_from_update() {
        let cache = ResourceCache::new(ar());
        let queue = WorkQueue::new("t");
        cache.add_handler(Arc::new(WatchRegistration::new(
            queue.clone(),
            default_transform(),
            vec![Arc::new(crate::watch::SpecOrMetaChanged)],
        )));

        cache.apply(WatchEvent::Applied(deploy("web", "web")));
        assert_eq!(queue.get().await, Some(ObjectKey::new("prod", "web")));
        queue.done(&ObjectKey::new("prod", "web"));

        // same generation and labels: an update the predicate filters out
        cache.apply(WatchEvent::Applied(deploy("web", "web")));
        assert!(queue.is_empty());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn index_lookup_returns_sorted_matches() {
        let cache = ResourceCache::new(ar());
        cache.add_indexer("app", app_index()).expect("first registration");
        assert!(cache.add_indexer("app", app_index()).is_err());

        cache.apply(WatchEvent::Applied(deploy("web-b", "web")));
        cache.apply(WatchEvent::Applied(deploy("web-a", "web")));
        cache.apply(WatchEvent::Applied(deploy("api", "api")));

        let names: Vec<_> = cache
            .by_index("app", "web")
            .expect("index exists")
            .into_iter()
            .filter_map(|o| o.metadata.name)
            .collect();
        assert_eq!(names, vec!["web-a", "web-b"]);
        assert!(cache.by_index("zone", "z1").is_err());
    }

    /// Story: The watch reconnects and relists; an object deleted while the
    /// connection was down is pruned and its handlers see a delete.
    #[tokio::test]
    async fn story_relist_prunes_objects_missed_while_disconnected() {
        let cache = ResourceCache::new(ar());
        let queue = WorkQueue::new("t");
        cache.add_handler(Arc::new(WatchRegistration::new(
            queue.clone(),
            default_transform(),
            vec![],
        )));

        cache.apply(WatchEvent::Applied(deploy("keep", "a")));
        cache.apply(WatchEvent::Applied(deploy("gone", "b")));
        for _ in 0..2 {
            let k = queue.get().await.expect("key");
            queue.done(&k);
        }

        cache.apply(WatchEvent::Restarted);
        cache.apply(WatchEvent::Applied(deploy("keep", "a")));
        cache.apply(WatchEvent::Synced);

        assert_eq!(cache.len(), 1);
        let mut keys = vec![];
        while !queue.is_empty() {
            keys.push(queue.get().await.expect("key"));
        }
        assert!(keys.contains(&ObjectKey::new("prod", "gone")));
    }
}
