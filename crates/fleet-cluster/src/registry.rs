//! Fleet registry: the live set of cluster handles.
//!
//! Readers take a cheap clone of an immutable snapshot; rebuilds construct a
//! new map off-lock and swap it in. Handles are never restarted: a changed
//! descriptor gets a fresh handle and the old one is stopped once.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fleet_common::metrics;
use fleet_common::{Error, Result};
use fleet_queue::WorkQueue;

use crate::cache::IndexFn;
use crate::descriptor::ClusterDescriptor;
use crate::factory::HandleFactory;
use crate::handle::{ClusterHandle, Object};
use crate::source::ClusterConfigSource;
use crate::watch::{Predicate, Transform};

/// Runs against every handle before it is started; an error leaves that
/// handle unstarted and out of the snapshot
pub type BeforeStartHook = Arc<dyn Fn(&Arc<ClusterHandle>) -> Result<()> + Send + Sync>;

type Snapshot = Arc<BTreeMap<String, Arc<ClusterHandle>>>;

/// Registry tuning
#[derive(Clone, Debug)]
pub struct RegistryOptions {
    /// Time between rebuilds; zero disables periodic rebuilding
    pub rebuild_interval: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            rebuild_interval: Duration::from_secs(30),
        }
    }
}

/// The set of member clusters the controllers fan out to
pub struct FleetRegistry {
    source: Arc<dyn ClusterConfigSource>,
    factory: Arc<dyn HandleFactory>,
    options: RegistryOptions,
    snapshot: RwLock<Snapshot>,
    hooks: RwLock<Vec<BeforeStartHook>>,
    rebuild_lock: tokio::sync::Mutex<()>,
    started: AtomicBool,
    run_token: Mutex<Option<CancellationToken>>,
}

impl FleetRegistry {
    /// Build and pre-validate a handle for every descriptor the source
    /// returns. Any failure fails construction.
    pub async fn new(
        source: Arc<dyn ClusterConfigSource>,
        factory: Arc<dyn HandleFactory>,
        options: RegistryOptions,
    ) -> Result<Self> {
        let descriptors = source.get_all().await?;
        let mut handles = BTreeMap::new();
        for descriptor in &descriptors {
            let handle = factory.build(descriptor).await.map_err(|e| {
                Error::configuration(format!("cluster {}: {}", descriptor.name, e))
            })?;
            handles.insert(descriptor.name.clone(), handle);
        }
        info!(clusters = handles.len(), "fleet registry built");
        Ok(Self {
            source,
            factory,
            options,
            snapshot: RwLock::new(Arc::new(handles)),
            hooks: RwLock::new(Vec::new()),
            rebuild_lock: tokio::sync::Mutex::new(()),
            started: AtomicBool::new(false),
            run_token: Mutex::new(None),
        })
    }

    /// Add a hook that runs before each handle starts, including handles
    /// added by later rebuilds
    pub fn add_before_start_hook(&self, hook: BeforeStartHook) {
        self.hooks.write().push(hook);
    }

    /// Start every handle and the rebuild loop; returns when `cancel` fires.
    /// A second call fails.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted {
                component: "registry".to_string(),
            });
        }
        *self.run_token.lock() = Some(cancel.clone());

        let initial = self.snapshot();
        let mut started = BTreeMap::new();
        for (name, handle) in initial.iter() {
            if self.launch(handle, &cancel) {
                started.insert(name.clone(), handle.clone());
            }
        }
        *self.snapshot.write() = Arc::new(started);
        self.record_clusters();

        if self.options.rebuild_interval.is_zero() {
            debug!("periodic registry rebuild disabled");
        } else {
            let registry = self.clone();
            let token = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(registry.options.rebuild_interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = registry.rebuild().await {
                                warn!(error = %e, "registry rebuild failed");
                            }
                        }
                    }
                }
            });
        }

        cancel.cancelled().await;
        for handle in self.snapshot().values() {
            handle.stop();
        }
        info!("fleet registry stopped");
        Ok(())
    }

    /// Converge the snapshot on the source's current descriptors
    pub async fn rebuild(&self) -> Result<()> {
        let _guard = self.rebuild_lock.lock().await;
        let result = self.rebuild_locked().await;
        metrics::record_registry_rebuild(result.is_ok());
        result
    }

    async fn rebuild_locked(&self) -> Result<()> {
        let descriptors = self.source.get_all().await?;
        let current = self.snapshot();
        let cancel = self.run_token.lock().clone();

        let mut next = BTreeMap::new();
        let mut retired = Vec::new();
        for descriptor in &descriptors {
            match current.get(&descriptor.name) {
                Some(existing) if existing.descriptor().same_connection(descriptor) => {
                    next.insert(descriptor.name.clone(), existing.clone());
                }
                existing => match self.replacement(descriptor, cancel.as_ref()).await {
                    Some(fresh) => {
                        info!(cluster = %descriptor.name, "cluster handle added or replaced");
                        if let Some(old) = existing {
                            retired.push(old.clone());
                        }
                        next.insert(descriptor.name.clone(), fresh);
                    }
                    None => {
                        if let Some(old) = existing {
                            next.insert(descriptor.name.clone(), old.clone());
                        }
                    }
                },
            }
        }
        for (name, handle) in current.iter() {
            if !next.contains_key(name) {
                info!(cluster = %name, "cluster removed from fleet");
                retired.push(handle.clone());
            }
        }

        *self.snapshot.write() = Arc::new(next);
        self.record_clusters();

        if !retired.is_empty() {
            tokio::spawn(async move {
                for handle in retired {
                    handle.stop();
                }
            });
        }
        Ok(())
    }

    async fn replacement(
        &self,
        descriptor: &ClusterDescriptor,
        cancel: Option<&CancellationToken>,
    ) -> Option<Arc<ClusterHandle>> {
        let handle = match self.factory.build(descriptor).await {
            Ok(h) => h,
            Err(e) => {
                error!(cluster = %descriptor.name, error = %e, "failed to build cluster handle");
                return None;
            }
        };
        match cancel {
            Some(token) => self.launch(&handle, token).then_some(handle),
            // not started yet; `start` will launch it
            None => Some(handle),
        }
    }

    // Run hooks then start the handle in the background.
    fn launch(&self, handle: &Arc<ClusterHandle>, cancel: &CancellationToken) -> bool {
        let hooks = self.hooks.read().clone();
        for hook in &hooks {
            if let Err(e) = hook(handle) {
                error!(cluster = %handle.name(), error = %e, "before-start hook failed");
                return false;
            }
        }
        let runner = handle.clone();
        let token = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = runner.clone().start(token).await {
                error!(cluster = %runner.name(), error = %e, "cluster handle exited");
            }
        });
        true
    }

    fn snapshot(&self) -> Snapshot {
        self.snapshot.read().clone()
    }

    fn record_clusters(&self) {
        let snapshot = self.snapshot();
        let connected = snapshot.values().filter(|h| h.is_connected()).count();
        metrics::record_clusters(connected, snapshot.len() - connected);
    }

    /// Every registered handle, sorted by name
    pub fn get_all(&self) -> Vec<Arc<ClusterHandle>> {
        self.snapshot().values().cloned().collect()
    }

    /// Every handle whose last probe succeeded, sorted by name
    pub fn get_all_connected(&self) -> Vec<Arc<ClusterHandle>> {
        self.snapshot()
            .values()
            .filter(|h| h.is_connected())
            .cloned()
            .collect()
    }

    /// Handle by name, connected or not
    pub fn get_with_name(&self, name: &str) -> Result<Arc<ClusterHandle>> {
        self.snapshot()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ClusterNotFound {
                cluster: name.to_string(),
            })
    }

    /// Handle by name, only if its last probe succeeded
    pub fn get_connected_with_name(&self, name: &str) -> Result<Arc<ClusterHandle>> {
        let handle = self.get_with_name(name)?;
        if !handle.is_connected() {
            return Err(Error::ClusterDisconnected {
                cluster: name.to_string(),
            });
        }
        Ok(handle)
    }

    /// Register a watch on every handle
    pub fn watch<K: Object>(
        &self,
        queue: &WorkQueue,
        transform: &Transform,
        predicates: &[Arc<dyn Predicate>],
    ) -> Result<()> {
        self.each(|h| h.watch::<K>(queue.clone(), transform.clone(), predicates.to_vec()))
    }

    /// Add an index on every handle
    pub fn set_index_field<K: Object>(&self, field: &str, extractor: &IndexFn) -> Result<()> {
        self.each(|h| h.set_index_field::<K>(field, extractor.clone()))
    }

    /// Cache `K` on every handle
    pub fn trigger_sync<K: Object>(&self) -> Result<()> {
        self.each(|h| h.sync::<K>())
    }

    fn each(&self, f: impl Fn(&Arc<ClusterHandle>) -> Result<()>) -> Result<()> {
        for handle in self.snapshot().values() {
            f(handle).map_err(|e| {
                Error::internal_with_context(
                    "registry",
                    format!("cluster {}: {}", handle.name(), e),
                )
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::MockHandleFactory;
    use crate::handle::HandleOptions;
    use crate::source::MockClusterConfigSource;
    use crate::testing::InMemoryStore;
    use parking_lot::Mutex as PlMutex;

    fn build(descriptor: &ClusterDescriptor) -> Result<Arc<ClusterHandle>> {
        if descriptor.credential == "broken" {
            return Err(Error::configuration("unparseable kubeconfig"));
        }
        let store = InMemoryStore::new(descriptor.name.clone());
        store.set_healthy(descriptor.credential != "down");
        Ok(Arc::new(ClusterHandle::new(
            descriptor.clone(),
            Arc::new(store),
            HandleOptions::default(),
        )?))
    }

    fn factory() -> Arc<MockHandleFactory> {
        let mut factory = MockHandleFactory::new();
        factory.expect_build().returning(build);
        Arc::new(factory)
    }

    // Source whose answer the test can change between rebuilds
    fn source(
        current: Arc<PlMutex<Vec<ClusterDescriptor>>>,
    ) -> Arc<MockClusterConfigSource> {
        let mut source = MockClusterConfigSource::new();
        source
            .expect_get_all()
            .returning(move || Ok(current.lock().clone()));
        Arc::new(source)
    }

    async fn started(
        descriptors: Vec<ClusterDescriptor>,
    ) -> (
        Arc<FleetRegistry>,
        Arc<PlMutex<Vec<ClusterDescriptor>>>,
        CancellationToken,
    ) {
        let current = Arc::new(PlMutex::new(descriptors));
        let registry = Arc::new(
            FleetRegistry::new(
                source(current.clone()),
                factory(),
                RegistryOptions {
                    rebuild_interval: Duration::ZERO,
                },
            )
            .await
            .expect("registry"),
        );
        let token = CancellationToken::new();
        tokio::spawn(registry.clone().start(token.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        (registry, current, token)
    }

    #[tokio::test]
    async fn construction_fails_when_any_cluster_fails_to_build() {
        let current = Arc::new(PlMutex::new(vec![
            ClusterDescriptor::from_raw("east", "ok"),
            ClusterDescriptor::from_raw("west", "broken"),
        ]));
        let result = FleetRegistry::new(source(current), factory(), RegistryOptions::default()).await;
        let err = result.err().expect("west is broken");
        assert!(err.to_string().contains("west"));
    }

    #[tokio::test]
    async fn lookups_distinguish_missing_from_disconnected() {
        let (registry, _, token) = started(vec![
            ClusterDescriptor::from_raw("east", "ok"),
            ClusterDescriptor::from_raw("west", "down"),
        ])
        .await;

        assert!(registry.get_connected_with_name("east").is_ok());
        assert!(registry.get_with_name("west").is_ok());
        assert!(matches!(
            registry.get_connected_with_name("west"),
            Err(Error::ClusterDisconnected { .. })
        ));
        assert!(matches!(
            registry.get_with_name("south"),
            Err(Error::ClusterNotFound { .. })
        ));

        let connected: Vec<_> = registry
            .get_all_connected()
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        assert_eq!(connected, vec!["east"]);
        token.cancel();
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let (registry, _, token) = started(vec![]).await;
        let err = registry.clone().start(token.clone()).await.expect_err("second start");
        assert_eq!(err.to_string(), "registry can't repeat start");
        token.cancel();
    }

    /// Story: The cluster config directory changes between rebuilds. One
    /// cluster is untouched, one gets new credentials, one is removed and one
    /// is added. Untouched handles survive as the same instance; replaced and
    /// removed handles are stopped exactly once.
    #[tokio::test]
    async fn story_rebuild_converges_on_the_source() {
        let (registry, current, token) = started(vec![
            ClusterDescriptor::from_raw("east", "e1"),
            ClusterDescriptor::from_raw("west", "w1"),
            ClusterDescriptor::from_raw("north", "n1"),
        ])
        .await;
        let east = registry.get_with_name("east").expect("east");
        let west = registry.get_with_name("west").expect("west");
        let north = registry.get_with_name("north").expect("north");

        *current.lock() = vec![
            ClusterDescriptor::from_raw("east", "e1"),
            ClusterDescriptor::from_raw("west", "w2"),
            ClusterDescriptor::from_raw("south", "s1"),
        ];
        registry.rebuild().await.expect("rebuild");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let names: Vec<_> = registry.get_all().iter().map(|h| h.name().to_string()).collect();
        assert_eq!(names, vec!["east", "south", "west"]);
        assert!(Arc::ptr_eq(&east, &registry.get_with_name("east").expect("east")));

        let new_west = registry.get_with_name("west").expect("west");
        assert!(!Arc::ptr_eq(&west, &new_west));
        assert!(west.is_stopped() && north.is_stopped());
        assert!(!west.stop(), "retired handles were already stopped");
        assert!(new_west.is_started());
        assert!(!east.is_stopped());

        token.cancel();
    }

    /// Story: A replacement cluster's credentials are broken. The rebuild
    /// logs the failure and keeps serving the old handle.
    #[tokio::test]
    async fn story_failed_replacement_keeps_the_old_handle() {
        let (registry, current, token) =
            started(vec![ClusterDescriptor::from_raw("east", "e1")]).await;
        let east = registry.get_with_name("east").expect("east");

        *current.lock() = vec![ClusterDescriptor::from_raw("east", "broken")];
        registry.rebuild().await.expect("rebuild tolerates build failures");

        assert!(Arc::ptr_eq(&east, &registry.get_with_name("east").expect("east")));
        assert!(!east.is_stopped());
        token.cancel();
    }

    #[tokio::test]
    async fn failing_hook_keeps_the_handle_out_of_the_snapshot() {
        let current = Arc::new(PlMutex::new(vec![
            ClusterDescriptor::from_raw("east", "e"),
            ClusterDescriptor::from_raw("west", "w"),
        ]));
        let registry = Arc::new(
            FleetRegistry::new(
                source(current),
                factory(),
                RegistryOptions {
                    rebuild_interval: Duration::ZERO,
                },
            )
            .await
            .expect("registry"),
        );
        registry.add_before_start_hook(Arc::new(|h: &Arc<ClusterHandle>| {
            if h.name() == "west" {
                Err(Error::configuration("west rejected"))
            } else {
                Ok(())
            }
        }));
        let token = CancellationToken::new();
        tokio::spawn(registry.clone().start(token.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let names: Vec<_> = registry.get_all().iter().map(|h| h.name().to_string()).collect();
        assert_eq!(names, vec!["east"]);
        token.cancel();
    }

    #[tokio::test]
    async fn replicated_registration_reaches_every_handle() {
        use k8s_openapi::api::apps::v1::Deployment;

        let (registry, _, token) = started(vec![
            ClusterDescriptor::from_raw("east", "e"),
            ClusterDescriptor::from_raw("west", "w"),
        ])
        .await;
        let extractor: IndexFn = Arc::new(|_| vec![]);
        registry
            .set_index_field::<Deployment>("zone", &extractor)
            .expect("first registration");

        let err = registry
            .set_index_field::<Deployment>("zone", &extractor)
            .expect_err("duplicate index");
        assert!(err.to_string().contains("cluster east"));
        token.cancel();
    }
}
