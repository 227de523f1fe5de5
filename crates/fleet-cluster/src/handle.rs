//! Cluster handle: one live connection to one remote cluster.
//!
//! A handle is started exactly once and never restarted; the registry builds
//! a replacement instead. Connectivity is owned by the health probe alone.

use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fleet_common::{Error, Result};
use kube::api::{DynamicObject, PropagationPolicy};
use kube::discovery::ApiResource;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{resource_id, IndexFn, ResourceCache};
use crate::descriptor::ClusterDescriptor;
use crate::store::{ListSelector, ObjectStore};
use crate::watch::{Predicate, Transform, WatchRegistration};
use fleet_queue::WorkQueue;

/// Calls bounded below this are rejected; they are certain to time out
pub const MIN_EXEC_TIMEOUT: Duration = Duration::from_millis(100);
/// Health probing is disabled below this interval
pub const MIN_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Per-handle tuning
#[derive(Clone, Debug)]
pub struct HandleOptions {
    /// Bound applied to every API call
    pub exec_timeout: Duration,
    /// Time between health probes; below one second disables probing
    pub health_check_interval: Duration,
    /// Bound applied to a single health probe
    pub health_check_timeout: Duration,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            exec_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(5),
            health_check_timeout: Duration::from_secs(5),
        }
    }
}

/// Bound for typed resources the handle can read and write
pub trait Object:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> Object for K where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// One connection to one remote cluster
pub struct ClusterHandle {
    descriptor: ClusterDescriptor,
    store: Arc<dyn ObjectStore>,
    options: HandleOptions,
    connected: AtomicBool,
    started: AtomicBool,
    stopped: AtomicBool,
    cancel: CancellationToken,
    caches: DashMap<String, Arc<ResourceCache>>,
}

impl ClusterHandle {
    /// Build a handle; fails if the exec timeout is below [`MIN_EXEC_TIMEOUT`]
    pub fn new(
        descriptor: ClusterDescriptor,
        store: Arc<dyn ObjectStore>,
        options: HandleOptions,
    ) -> Result<Self> {
        if options.exec_timeout < MIN_EXEC_TIMEOUT {
            return Err(Error::configuration(format!(
                "cluster {}: exec timeout {:?} is below {:?} and certain to time out",
                descriptor.name, options.exec_timeout, MIN_EXEC_TIMEOUT
            )));
        }
        Ok(Self {
            descriptor,
            store,
            options,
            connected: AtomicBool::new(false),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            caches: DashMap::new(),
        })
    }

    /// Cluster name
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Descriptor the handle was built from
    pub fn descriptor(&self) -> &ClusterDescriptor {
        &self.descriptor
    }

    /// Result of the most recent health probe
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// True once `start` has been called
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// True once `stop` has been called
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Run informers and the health probe until `cancel` fires or the handle
    /// is stopped. A second call fails.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted {
                component: format!("cluster {}", self.name()),
            });
        }
        info!(cluster = %self.name(), "starting cluster handle");

        self.probe().await;
        let informers: Vec<Arc<ResourceCache>> =
            self.caches.iter().map(|e| e.value().clone()).collect();
        for cache in informers {
            self.spawn_informer(cache);
        }

        if self.options.health_check_interval >= MIN_HEALTH_CHECK_INTERVAL {
            let handle = self.clone();
            let token = self.cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(handle.options.health_check_interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => { handle.probe().await; }
                    }
                }
            });
        } else {
            debug!(cluster = %self.name(), "health probing disabled");
        }

        tokio::select! {
            _ = cancel.cancelled() => self.cancel.cancel(),
            _ = self.cancel.cancelled() => {}
        }
        info!(cluster = %self.name(), "cluster handle stopped");
        Ok(())
    }

    /// Stop the handle; returns true only for the call that stopped it
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    /// Probe `/healthz` once and record the outcome
    pub async fn probe(&self) -> bool {
        let healthy = matches!(
            tokio::time::timeout(self.options.health_check_timeout, self.store.healthz()).await,
            Ok(Ok(ref body)) if body.trim() == "ok"
        );
        let was = self.connected.swap(healthy, Ordering::SeqCst);
        if was != healthy {
            if healthy {
                info!(cluster = %self.name(), "cluster connected");
            } else {
                warn!(cluster = %self.name(), "cluster health check failed");
            }
        }
        healthy
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.options.exec_timeout, fut)
            .await
            .map_err(|_| Error::Timeout {
                cluster: self.name().to_string(),
                operation: operation.to_string(),
                timeout: self.options.exec_timeout,
            })?
    }

    /// Fetch one object; a missing object is `Error::NotFound`
    pub async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<K> {
        let ar = ApiResource::erase::<K>(&());
        let obj = self.bounded("get", self.store.get(&ar, namespace, name)).await?;
        from_dynamic(obj)
    }

    /// List objects matching `selector`
    pub async fn list<K: Object>(
        &self,
        namespace: Option<&str>,
        selector: &ListSelector,
    ) -> Result<Vec<K>> {
        let ar = ApiResource::erase::<K>(&());
        let objs = self
            .bounded("list", self.store.list(&ar, namespace, selector))
            .await?;
        objs.into_iter().map(from_dynamic).collect()
    }

    /// Create an object
    pub async fn create<K: Object>(&self, obj: &K) -> Result<K> {
        let ar = ApiResource::erase::<K>(&());
        let dynamic = to_dynamic(obj)?;
        let created = self.bounded("create", self.store.create(&ar, &dynamic)).await?;
        from_dynamic(created)
    }

    /// Replace an object; its resource version must be current
    pub async fn update<K: Object>(&self, obj: &K) -> Result<K> {
        let ar = ApiResource::erase::<K>(&());
        let dynamic = to_dynamic(obj)?;
        let updated = self.bounded("update", self.store.replace(&ar, &dynamic)).await?;
        from_dynamic(updated)
    }

    /// Replace the status subresource; the resource version must be current
    pub async fn update_status<K: Object>(&self, obj: &K) -> Result<K> {
        let ar = ApiResource::erase::<K>(&());
        let dynamic = to_dynamic(obj)?;
        let updated = self
            .bounded("update_status", self.store.replace_status(&ar, &dynamic))
            .await?;
        from_dynamic(updated)
    }

    /// Apply a JSON merge patch
    pub async fn patch<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K> {
        let ar = ApiResource::erase::<K>(&());
        let patched = self
            .bounded("patch", self.store.patch(&ar, namespace, name, patch))
            .await?;
        from_dynamic(patched)
    }

    /// Delete one object
    pub async fn delete<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        propagation: Option<PropagationPolicy>,
    ) -> Result<()> {
        let ar = ApiResource::erase::<K>(&());
        self.bounded("delete", self.store.delete(&ar, namespace, name, propagation))
            .await
    }

    /// Delete every matching object in `namespace`
    pub async fn delete_all_of<K: Object>(
        &self,
        namespace: &str,
        selector: &ListSelector,
    ) -> Result<()> {
        let ar = ApiResource::erase::<K>(&());
        self.bounded(
            "delete_all_of",
            self.store.delete_collection(&ar, namespace, selector),
        )
        .await
    }

    /// Register a cache-backed watch feeding `queue`.
    ///
    /// Registered before start, the informer starts with the handle; after
    /// start it starts immediately.
    pub fn watch<K: Object>(
        &self,
        queue: WorkQueue,
        transform: Transform,
        predicates: Vec<Arc<dyn Predicate>>,
    ) -> Result<()> {
        self.ensure_running()?;
        let cache = self.cache_for(ApiResource::erase::<K>(&()));
        cache.add_handler(Arc::new(WatchRegistration::new(queue, transform, predicates)));
        if self.is_started() {
            self.spawn_informer(cache);
        }
        Ok(())
    }

    /// Cache `K` without a handler so that index lookups have data
    pub fn sync<K: Object>(&self) -> Result<()> {
        self.ensure_running()?;
        let cache = self.cache_for(ApiResource::erase::<K>(&()));
        if self.is_started() {
            self.spawn_informer(cache);
        }
        Ok(())
    }

    /// Add a secondary index over cached `K` objects
    pub fn set_index_field<K: Object>(&self, field: &str, extractor: IndexFn) -> Result<()> {
        self.ensure_running()?;
        self.cache_for(ApiResource::erase::<K>(&()))
            .add_indexer(field, extractor)
    }

    /// Cached `K` objects whose `field` index contains `value`
    pub fn list_indexed<K: Object>(&self, field: &str, value: &str) -> Result<Vec<K>> {
        let ar = ApiResource::erase::<K>(&());
        let cache = self
            .caches
            .get(&resource_id(&ar))
            .map(|c| c.value().clone())
            .ok_or_else(|| {
                Error::configuration(format!(
                    "cluster {}: {} is not cached",
                    self.name(),
                    ar.kind
                ))
            })?;
        cache
            .by_index(field, value)?
            .into_iter()
            .map(from_dynamic)
            .collect()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::internal_with_context(
                "cluster_handle",
                format!("cluster {} is stopped", self.name()),
            ));
        }
        Ok(())
    }

    fn cache_for(&self, ar: ApiResource) -> Arc<ResourceCache> {
        self.caches
            .entry(resource_id(&ar))
            .or_insert_with(|| Arc::new(ResourceCache::new(ar)))
            .value()
            .clone()
    }

    fn spawn_informer(&self, cache: Arc<ResourceCache>) {
        if !cache.claim() {
            return;
        }
        debug!(cluster = %self.name(), kind = %cache.resource.kind, "starting informer");
        let stream = self.store.watch(&cache.resource, None);
        let token = self.cancel.child_token();
        tokio::spawn(async move { cache.consume(stream, token).await });
    }
}

impl Debug for ClusterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterHandle")
            .field("name", &self.descriptor.name)
            .field("connected", &self.is_connected())
            .field("started", &self.is_started())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Convert a typed resource into the store's untyped form
pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject> {
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|e| Error::serialization(e.to_string()))
}

/// Convert an untyped object back into `K`
pub fn from_dynamic<K: Object>(obj: DynamicObject) -> Result<K> {
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()).to_string(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryStore;
    use crate::watch::default_transform;
    use fleet_common::ObjectKey;
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
    use kube::api::ObjectMeta;

    fn deployment(name: &str, replicas: i32) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("prod".into()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn handle(store: Arc<InMemoryStore>, options: HandleOptions) -> Arc<ClusterHandle> {
        Arc::new(
            ClusterHandle::new(ClusterDescriptor::from_raw("east", "cfg"), store, options)
                .expect("valid options"),
        )
    }

    #[test]
    fn exec_timeout_floor_is_enforced() {
        let err = ClusterHandle::new(
            ClusterDescriptor::from_raw("east", "cfg"),
            Arc::new(InMemoryStore::new("east")),
            HandleOptions {
                exec_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        )
        .expect_err("50ms must be rejected");
        assert!(err.to_string().contains("certain to time out"));
    }

    #[tokio::test]
    async fn typed_crud_round_trips_through_the_store() {
        let h = handle(Arc::new(InMemoryStore::new("east")), HandleOptions::default());

        let created = h.create(&deployment("web", 3)).await.expect("create");
        assert!(created.metadata.resource_version.is_some());

        let fetched: Deployment = h.get("prod", "web").await.expect("get");
        assert_eq!(fetched.spec.and_then(|s| s.replicas), Some(3));

        h.delete::<Deployment>("prod", "web", None).await.expect("delete");
        let err = h.get::<Deployment>("prod", "web").await.expect_err("gone");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let h = handle(Arc::new(InMemoryStore::new("east")), HandleOptions::default());
        let token = CancellationToken::new();
        let first = tokio::spawn(h.clone().start(token.clone()));
        tokio::task::yield_now().await;

        let second = h.clone().start(token.clone()).await;
        assert!(matches!(second, Err(Error::AlreadyStarted { .. })));

        token.cancel();
        first.await.expect("join").expect("first start ends cleanly");
    }

    /// Story: The API server of a member cluster goes unhealthy. The handle
    /// keeps running; only the connectivity flag follows the probe.
    #[tokio::test(start_paused = true)]
    async fn story_health_probe_only_flips_connectivity() {
        let store = Arc::new(InMemoryStore::new("east"));
        let h = handle(
            store.clone(),
            HandleOptions {
                health_check_interval: Duration::from_secs(1),
                ..Default::default()
            },
        );
        let token = CancellationToken::new();
        let running = tokio::spawn(h.clone().start(token.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.is_connected(), "first probe runs immediately");

        store.set_healthy(false);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!h.is_connected());
        assert!(!running.is_finished(), "probe failure never stops the handle");

        store.set_healthy(true);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.is_connected());

        token.cancel();
        running.await.expect("join").expect("clean stop");
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_ends_start() {
        let h = handle(Arc::new(InMemoryStore::new("east")), HandleOptions::default());
        let running = tokio::spawn(h.clone().start(CancellationToken::new()));
        tokio::task::yield_now().await;

        assert!(h.stop());
        assert!(!h.stop());
        running.await.expect("join").expect("clean stop");
        assert!(h.watch::<Deployment>(WorkQueue::new("q"), default_transform(), vec![]).is_err());
    }

    #[tokio::test]
    async fn watch_after_start_feeds_queue_and_index() {
        let store = Arc::new(InMemoryStore::new("east"));
        store.seed(&deployment("web", 1));
        let h = handle(store.clone(), HandleOptions::default());
        let token = CancellationToken::new();
        let running = tokio::spawn(h.clone().start(token.clone()));
        tokio::task::yield_now().await;

        let queue = WorkQueue::new("deploys");
        h.set_index_field::<Deployment>(
            "replicas",
            Arc::new(|o: &DynamicObject| {
                o.data
                    .pointer("/spec/replicas")
                    .map(|v| v.to_string())
                    .into_iter()
                    .collect()
            }),
        )
        .expect("index");
        h.watch::<Deployment>(queue.clone(), default_transform(), vec![])
            .expect("watch");

        let key = tokio::time::timeout(Duration::from_secs(1), queue.get())
            .await
            .expect("initial list is delivered");
        assert_eq!(key, Some(ObjectKey::new("prod", "web")));

        let indexed: Vec<Deployment> = h.list_indexed("replicas", "1").expect("indexed");
        assert_eq!(indexed.len(), 1);

        token.cancel();
        running.await.expect("join").expect("clean stop");
    }
}
