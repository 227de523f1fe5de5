//! In-memory [`ObjectStore`] for tests.
//!
//! Behaves like an API server where it matters to the reconcilers: resource
//! versions, generation bumps on spec changes, status subresource isolation,
//! finalizer-gated deletion and a relisting watch. Failures can be injected
//! per operation and kind.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_common::{Error, Result};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{DynamicObject, PropagationPolicy};
use kube::core::TypeMeta;
use kube::discovery::ApiResource;
use kube::Resource;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::cache::resource_id;
use crate::descriptor::ClusterDescriptor;
use crate::factory::HandleFactory;
use crate::handle::{ClusterHandle, HandleOptions};
use crate::registry::{FleetRegistry, RegistryOptions};
use crate::source::ClusterConfigSource;
use crate::store::{ListSelector, ObjectStore, WatchEvent};

/// Store operations that can be counted or failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    /// `get`
    Get,
    /// `list`
    List,
    /// `create`
    Create,
    /// `replace`
    Replace,
    /// `replace_status`
    ReplaceStatus,
    /// `patch`
    Patch,
    /// `delete`
    Delete,
    /// `delete_collection`
    DeleteCollection,
}

/// Failure returned by an injected fault
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Failure {
    /// Stale resource version
    Conflict,
    /// Rejected as invalid (immutable field)
    Invalid,
    /// Server unreachable
    Unavailable,
}

struct Fault {
    op: Op,
    kind: String,
    remaining: usize,
    failure: Failure,
}

type Key = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, DynamicObject>,
    resource_version: u64,
    faults: Vec<Fault>,
    calls: HashMap<(Op, String), usize>,
}

/// In-memory stand-in for one cluster's API server
pub struct InMemoryStore {
    cluster: String,
    state: Mutex<State>,
    healthy: AtomicBool,
    events: broadcast::Sender<(String, WatchEvent)>,
}

impl InMemoryStore {
    /// Empty, healthy store for the named cluster
    pub fn new(cluster: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            cluster: cluster.into(),
            state: Mutex::new(State::default()),
            healthy: AtomicBool::new(true),
            events,
        }
    }

    /// Make `/healthz` answer `ok` or fail
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Fail the next `times` calls of `op` on `kind`
    pub fn fail_next(&self, op: Op, kind: &str, times: usize, failure: Failure) {
        self.state.lock().faults.push(Fault {
            op,
            kind: kind.to_string(),
            remaining: times,
            failure,
        });
    }

    /// Number of `op` calls made on `kind`, including failed ones
    pub fn call_count(&self, op: Op, kind: &str) -> usize {
        self.state
            .lock()
            .calls
            .get(&(op, kind.to_string()))
            .copied()
            .unwrap_or_default()
    }

    /// Insert an object as-is, status included, bypassing faults and counters
    pub fn seed<K>(&self, obj: &K) -> DynamicObject
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let ar = ApiResource::erase::<K>(&());
        let mut dynamic: DynamicObject = serde_json::to_value(obj)
            .and_then(serde_json::from_value)
            .unwrap_or_else(|e| panic!("seed object must serialize: {e}"));
        let mut state = self.state.lock();
        state.resource_version += 1;
        dynamic.metadata.resource_version = Some(state.resource_version.to_string());
        dynamic.metadata.generation = dynamic.metadata.generation.or(Some(1));
        dynamic.types = Some(types(&ar));
        state
            .objects
            .insert(key_of(&ar, &dynamic), dynamic.clone());
        drop(state);
        self.emit(&ar, WatchEvent::Applied(dynamic.clone()));
        dynamic
    }

    /// Overwrite the status of a stored object, as a kubelet or child
    /// controller would
    pub fn set_status<K>(&self, namespace: &str, name: &str, status: Value)
    where
        K: Resource<DynamicType = ()>,
    {
        let ar = ApiResource::erase::<K>(&());
        let key = (resource_id(&ar), namespace.to_string(), name.to_string());
        let mut state = self.state.lock();
        state.resource_version += 1;
        let rv = state.resource_version.to_string();
        let Some(obj) = state.objects.get_mut(&key) else {
            panic!("set_status on missing {} {}/{}", ar.kind, namespace, name);
        };
        set_field(&mut obj.data, "status", status);
        obj.metadata.resource_version = Some(rv);
        let updated = obj.clone();
        drop(state);
        self.emit(&ar, WatchEvent::Applied(updated));
    }

    /// Every stored object of a resource type, sorted by namespace and name
    pub fn objects_of<K>(&self) -> Vec<DynamicObject>
    where
        K: Resource<DynamicType = ()>,
    {
        let id = resource_id(&ApiResource::erase::<K>(&()));
        self.state
            .lock()
            .objects
            .iter()
            .filter(|((rid, _, _), _)| *rid == id)
            .map(|(_, o)| o.clone())
            .collect()
    }

    fn begin(&self, op: Op, ar: &ApiResource, key: &str) -> Result<()> {
        let mut state = self.state.lock();
        *state.calls.entry((op, ar.kind.clone())).or_default() += 1;
        let fault = state
            .faults
            .iter_mut()
            .find(|f| f.op == op && f.kind == ar.kind && f.remaining > 0);
        let Some(fault) = fault else {
            return Ok(());
        };
        fault.remaining -= 1;
        Err(match fault.failure {
            Failure::Conflict => {
                Error::conflict(&self.cluster, &ar.kind, key, "injected conflict")
            }
            Failure::Invalid => Error::invalid(&self.cluster, &ar.kind, key, "field is immutable"),
            Failure::Unavailable => Error::internal_with_context(
                "in_memory_store",
                format!("cluster {} unavailable", self.cluster),
            ),
        })
    }

    fn emit(&self, ar: &ApiResource, event: WatchEvent) {
        let _ = self.events.send((resource_id(ar), event));
    }

    fn missing(&self, ar: &ApiResource, namespace: &str, name: &str) -> Error {
        Error::not_found(&self.cluster, &ar.kind, format!("{}/{}", namespace, name))
    }

    fn check_version(
        &self,
        ar: &ApiResource,
        current: &DynamicObject,
        incoming: &DynamicObject,
    ) -> Result<()> {
        match &incoming.metadata.resource_version {
            Some(rv) if Some(rv) != current.metadata.resource_version.as_ref() => {
                Err(Error::conflict(
                    &self.cluster,
                    &ar.kind,
                    display_key(incoming),
                    "the object has been modified; please apply your changes to the latest version",
                ))
            }
            _ => Ok(()),
        }
    }

    // Stores `next` over `current`, bumping versions; a terminating object
    // without finalizers is removed instead.
    fn commit(
        &self,
        state: &mut State,
        ar: &ApiResource,
        key: Key,
        current: &DynamicObject,
        mut next: DynamicObject,
    ) -> (DynamicObject, WatchEvent) {
        state.resource_version += 1;
        next.metadata.resource_version = Some(state.resource_version.to_string());
        next.metadata.uid = current.metadata.uid.clone();
        next.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        next.metadata.deletion_timestamp = current.metadata.deletion_timestamp.clone();
        let generation = current.metadata.generation.unwrap_or(1);
        next.metadata.generation = Some(if spec_of(current) != spec_of(&next) {
            generation + 1
        } else {
            generation
        });
        next.types = Some(types(ar));

        let finalizers_empty = next
            .metadata
            .finalizers
            .as_ref()
            .map_or(true, |f| f.is_empty());
        if next.metadata.deletion_timestamp.is_some() && finalizers_empty {
            state.objects.remove(&key);
            return (next.clone(), WatchEvent::Deleted(next));
        }
        state.objects.insert(key, next.clone());
        (next.clone(), WatchEvent::Applied(next))
    }
}

fn types(ar: &ApiResource) -> TypeMeta {
    TypeMeta {
        api_version: ar.api_version.clone(),
        kind: ar.kind.clone(),
    }
}

fn key_of(ar: &ApiResource, obj: &DynamicObject) -> Key {
    (
        resource_id(ar),
        obj.metadata.namespace.clone().unwrap_or_default(),
        obj.metadata.name.clone().unwrap_or_default(),
    )
}

fn display_key(obj: &DynamicObject) -> String {
    format!(
        "{}/{}",
        obj.metadata.namespace.as_deref().unwrap_or_default(),
        obj.metadata.name.as_deref().unwrap_or_default()
    )
}

fn spec_of(obj: &DynamicObject) -> Value {
    let mut data = obj.data.clone();
    if let Value::Object(map) = &mut data {
        map.remove("status");
    }
    data
}

fn status_of(obj: &DynamicObject) -> Option<Value> {
    obj.data.get("status").cloned()
}

fn set_field(data: &mut Value, field: &str, value: Value) {
    if !data.is_object() {
        *data = Value::Object(Default::default());
    }
    if let Value::Object(map) = data {
        map.insert(field.to_string(), value);
    }
}

fn without_status(mut obj: DynamicObject) -> DynamicObject {
    if let Value::Object(map) = &mut obj.data {
        map.remove("status");
    }
    obj
}

fn with_status(mut obj: DynamicObject, status: Option<Value>) -> DynamicObject {
    obj = without_status(obj);
    if let Some(status) = status {
        set_field(&mut obj.data, "status", status);
    }
    obj
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<DynamicObject> {
        self.begin(Op::Get, ar, &format!("{}/{}", namespace, name))?;
        let key = (resource_id(ar), namespace.to_string(), name.to_string());
        self.state
            .lock()
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| self.missing(ar, namespace, name))
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        selector: &ListSelector,
    ) -> Result<Vec<DynamicObject>> {
        self.begin(Op::List, ar, namespace.unwrap_or_default())?;
        let id = resource_id(ar);
        Ok(self
            .state
            .lock()
            .objects
            .iter()
            .filter(|((rid, ns, _), _)| *rid == id && namespace.map_or(true, |n| n == ns))
            .map(|(_, o)| o)
            .filter(|o| selector.matches(o))
            .cloned()
            .collect())
    }

    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        self.begin(Op::Create, ar, &display_key(obj))?;
        let key = key_of(ar, obj);
        let mut state = self.state.lock();
        if state.objects.contains_key(&key) {
            return Err(Error::conflict(
                &self.cluster,
                &ar.kind,
                display_key(obj),
                "already exists",
            ));
        }
        state.resource_version += 1;
        let mut created = without_status(obj.clone());
        created.metadata.resource_version = Some(state.resource_version.to_string());
        created.metadata.generation = Some(1);
        created.metadata.uid = Some(format!("uid-{}", state.resource_version));
        created.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        created.metadata.deletion_timestamp = None;
        created.types = Some(types(ar));
        state.objects.insert(key, created.clone());
        drop(state);
        self.emit(ar, WatchEvent::Applied(created.clone()));
        Ok(created)
    }

    async fn replace(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        self.begin(Op::Replace, ar, &display_key(obj))?;
        let key = key_of(ar, obj);
        let mut state = self.state.lock();
        let current = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| self.missing(ar, &key.1, &key.2))?;
        self.check_version(ar, &current, obj)?;
        let next = with_status(obj.clone(), status_of(&current));
        let (stored, event) = self.commit(&mut state, ar, key, &current, next);
        drop(state);
        self.emit(ar, event);
        Ok(stored)
    }

    async fn replace_status(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        self.begin(Op::ReplaceStatus, ar, &display_key(obj))?;
        let key = key_of(ar, obj);
        let mut state = self.state.lock();
        let current = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| self.missing(ar, &key.1, &key.2))?;
        self.check_version(ar, &current, obj)?;
        let next = with_status(current.clone(), status_of(obj));
        let (stored, event) = self.commit(&mut state, ar, key, &current, next);
        drop(state);
        self.emit(ar, event);
        Ok(stored)
    }

    async fn patch(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject> {
        self.begin(Op::Patch, ar, &format!("{}/{}", namespace, name))?;
        let key = (resource_id(ar), namespace.to_string(), name.to_string());
        let mut state = self.state.lock();
        let current = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| self.missing(ar, namespace, name))?;
        let mut doc =
            serde_json::to_value(&current).map_err(|e| Error::serialization(e.to_string()))?;
        json_patch::merge(&mut doc, patch);
        let patched: DynamicObject =
            serde_json::from_value(doc).map_err(|e| Error::serialization(e.to_string()))?;
        let next = with_status(patched, status_of(&current));
        let (stored, event) = self.commit(&mut state, ar, key, &current, next);
        drop(state);
        self.emit(ar, event);
        Ok(stored)
    }

    async fn delete(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
        _propagation: Option<PropagationPolicy>,
    ) -> Result<()> {
        self.begin(Op::Delete, ar, &format!("{}/{}", namespace, name))?;
        let key = (resource_id(ar), namespace.to_string(), name.to_string());
        let mut state = self.state.lock();
        let current = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| self.missing(ar, namespace, name))?;
        let has_finalizers = current
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty());
        let event = if has_finalizers {
            if current.metadata.deletion_timestamp.is_some() {
                return Ok(());
            }
            state.resource_version += 1;
            let mut terminating = current;
            terminating.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            terminating.metadata.resource_version = Some(state.resource_version.to_string());
            state.objects.insert(key, terminating.clone());
            WatchEvent::Applied(terminating)
        } else {
            state.objects.remove(&key);
            WatchEvent::Deleted(current)
        };
        drop(state);
        self.emit(ar, event);
        Ok(())
    }

    async fn delete_collection(
        &self,
        ar: &ApiResource,
        namespace: &str,
        selector: &ListSelector,
    ) -> Result<()> {
        self.begin(Op::DeleteCollection, ar, namespace)?;
        let id = resource_id(ar);
        let names: Vec<String> = self
            .state
            .lock()
            .objects
            .iter()
            .filter(|((rid, ns, _), o)| *rid == id && ns == namespace && selector.matches(o))
            .map(|((_, _, name), _)| name.clone())
            .collect();
        for name in names {
            let key = (id.clone(), namespace.to_string(), name);
            let removed = self.state.lock().objects.remove(&key);
            if let Some(obj) = removed {
                self.emit(ar, WatchEvent::Deleted(obj));
            }
        }
        Ok(())
    }

    async fn healthz(&self) -> Result<String> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok("ok".to_string())
        } else {
            Err(Error::internal_with_context(
                "healthz",
                format!("cluster {} is unhealthy", self.cluster),
            ))
        }
    }

    fn watch(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
    ) -> BoxStream<'static, Result<WatchEvent>> {
        let id = resource_id(ar);
        let namespace = namespace.map(str::to_string);
        let receiver = self.events.subscribe();

        let in_scope = {
            let namespace = namespace.clone();
            move |obj: &DynamicObject| {
                namespace
                    .as_deref()
                    .map_or(true, |ns| obj.metadata.namespace.as_deref() == Some(ns))
            }
        };

        let mut initial = vec![Ok(WatchEvent::Restarted)];
        initial.extend(
            self.state
                .lock()
                .objects
                .iter()
                .filter(|((rid, _, _), o)| *rid == id && in_scope(o))
                .map(|(_, o)| Ok(WatchEvent::Applied(o.clone()))),
        );
        initial.push(Ok(WatchEvent::Synced));

        let live = stream::unfold(receiver, move |mut rx| {
            let id = id.clone();
            let in_scope = in_scope.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok((rid, event)) if rid == id => {
                            let relevant = match &event {
                                WatchEvent::Applied(o) | WatchEvent::Deleted(o) => in_scope(o),
                                _ => true,
                            };
                            if relevant {
                                return Some((Ok(event), rx));
                            }
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        stream::iter(initial).chain(live).boxed()
    }
}

/// Registry over in-memory clusters, every handle probed once so that
/// healthy stores count as connected
pub async fn fleet(stores: &[Arc<InMemoryStore>]) -> Arc<FleetRegistry> {
    let registry = FleetRegistry::new(
        Arc::new(StaticSource {
            names: stores.iter().map(|s| s.cluster.clone()).collect(),
        }),
        Arc::new(StaticFactory {
            stores: stores.to_vec(),
        }),
        RegistryOptions {
            rebuild_interval: Duration::ZERO,
        },
    )
    .await
    .unwrap_or_else(|e| panic!("in-memory fleet must build: {e}"));
    for handle in registry.get_all() {
        handle.probe().await;
    }
    Arc::new(registry)
}

struct StaticSource {
    names: Vec<String>,
}

#[async_trait]
impl ClusterConfigSource for StaticSource {
    async fn get_all(&self) -> Result<Vec<ClusterDescriptor>> {
        Ok(self
            .names
            .iter()
            .map(|n| ClusterDescriptor::from_raw(n.as_str(), "in-memory"))
            .collect())
    }
}

struct StaticFactory {
    stores: Vec<Arc<InMemoryStore>>,
}

#[async_trait]
impl HandleFactory for StaticFactory {
    async fn build(&self, descriptor: &ClusterDescriptor) -> Result<Arc<ClusterHandle>> {
        let store = self
            .stores
            .iter()
            .find(|s| s.cluster == descriptor.name)
            .cloned()
            .ok_or_else(|| Error::ClusterNotFound {
                cluster: descriptor.name.clone(),
            })?;
        Ok(Arc::new(ClusterHandle::new(
            descriptor.clone(),
            store,
            HandleOptions::default(),
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;

    fn ar() -> ApiResource {
        ApiResource::erase::<Deployment>(&())
    }

    fn deploy(name: &str, replicas: i64) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &ar()).within("prod");
        obj.data = serde_json::json!({"spec": {"replicas": replicas}});
        obj
    }

    #[tokio::test]
    async fn stale_resource_version_is_a_conflict() {
        let store = InMemoryStore::new("east");
        let created = store.create(&ar(), &deploy("web", 1)).await.expect("create");

        let mut first = created.clone();
        first.data = serde_json::json!({"spec": {"replicas": 2}});
        let updated = store.replace(&ar(), &first).await.expect("fresh write");
        assert_eq!(updated.metadata.generation, Some(2));

        let err = store.replace(&ar(), &created).await.expect_err("stale write");
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn status_writes_do_not_touch_spec_or_generation() {
        let store = InMemoryStore::new("east");
        let mut with_status = deploy("web", 1);
        with_status.data["status"] = serde_json::json!({"replicas": 9});
        let created = store.create(&ar(), &with_status).await.expect("create");
        assert!(created.data.get("status").is_none(), "status dropped on create");

        let mut status = created.clone();
        status.data = serde_json::json!({"spec": {"replicas": 5}, "status": {"replicas": 1}});
        let stored = store.replace_status(&ar(), &status).await.expect("status");
        assert_eq!(stored.data["spec"]["replicas"], 1);
        assert_eq!(stored.data["status"]["replicas"], 1);
        assert_eq!(stored.metadata.generation, Some(1));
    }

    #[tokio::test]
    async fn finalizers_hold_deletion_until_removed() {
        let store = InMemoryStore::new("east");
        let mut obj = deploy("web", 1);
        obj.metadata.finalizers = Some(vec!["fleet.io/finalizer".into()]);
        store.create(&ar(), &obj).await.expect("create");

        store.delete(&ar(), "prod", "web", None).await.expect("delete");
        let terminating = store.get(&ar(), "prod", "web").await.expect("still present");
        assert!(terminating.metadata.deletion_timestamp.is_some());

        store
            .patch(&ar(), "prod", "web", &serde_json::json!({"metadata": {"finalizers": null}}))
            .await
            .expect("strip finalizer");
        assert!(store.get(&ar(), "prod", "web").await.expect_err("gone").is_not_found());
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_and_counted() {
        let store = InMemoryStore::new("east");
        store.fail_next(Op::Create, "Deployment", 1, Failure::Invalid);

        let err = store.create(&ar(), &deploy("web", 1)).await.expect_err("fault");
        assert!(err.is_invalid());
        store.create(&ar(), &deploy("web", 1)).await.expect("fault consumed");
        assert_eq!(store.call_count(Op::Create, "Deployment"), 2);
    }

    #[tokio::test]
    async fn watch_relists_then_streams_live_events() {
        let store = InMemoryStore::new("east");
        store.create(&ar(), &deploy("a", 1)).await.expect("create");
        let mut events = store.watch(&ar(), Some("prod"));

        assert!(matches!(events.next().await, Some(Ok(WatchEvent::Restarted))));
        assert!(matches!(events.next().await, Some(Ok(WatchEvent::Applied(_)))));
        assert!(matches!(events.next().await, Some(Ok(WatchEvent::Synced))));

        store.delete(&ar(), "prod", "a", None).await.expect("delete");
        match events.next().await {
            Some(Ok(WatchEvent::Deleted(o))) => assert_eq!(o.metadata.name.as_deref(), Some("a")),
            other => panic!("expected delete, got {:?}", other),
        }
    }
}
