//! Object store seam between cluster handles and an API server.
//!
//! Everything above this trait works on typed resources; everything below it
//! works on [`DynamicObject`]s addressed by [`ApiResource`]. The kube-backed
//! implementation maps API status codes onto the fleet error taxonomy.

use std::collections::BTreeMap;

use async_trait::async_trait;
use fleet_common::{Error, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
    PropagationPolicy,
};
use kube::core::TypeMeta;
use kube::discovery::ApiResource;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;

/// Label and field equality selectors for list calls
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListSelector {
    /// Label equality requirements
    pub labels: BTreeMap<String, String>,
    /// Field equality requirements, keyed by dotted path (e.g. `type`,
    /// `involvedObject.kind`)
    pub fields: BTreeMap<String, String>,
}

impl ListSelector {
    /// Match everything
    pub fn everything() -> Self {
        Self::default()
    }

    /// Add a label requirement
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add a field requirement
    pub fn field(mut self, path: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(path.into(), value.into());
        self
    }

    /// Label selector in API server syntax
    pub fn label_selector(&self) -> String {
        join_selector(&self.labels)
    }

    /// Field selector in API server syntax
    pub fn field_selector(&self) -> String {
        join_selector(&self.fields)
    }

    /// Evaluate the selector against an object, for stores without a server
    pub fn matches(&self, obj: &DynamicObject) -> bool {
        let labels = obj.metadata.labels.as_ref();
        let labels_match = self
            .labels
            .iter()
            .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v));
        if !labels_match {
            return false;
        }
        if self.fields.is_empty() {
            return true;
        }
        let Ok(value) = serde_json::to_value(obj) else {
            return false;
        };
        self.fields.iter().all(|(path, expected)| {
            let found = path
                .split('.')
                .try_fold(&value, |v, segment| v.get(segment));
            match found {
                Some(serde_json::Value::String(s)) => s == expected,
                Some(other) => other.to_string() == *expected,
                None => expected.is_empty(),
            }
        })
    }

    fn list_params(&self) -> ListParams {
        let mut lp = ListParams::default();
        if !self.labels.is_empty() {
            lp = lp.labels(&self.label_selector());
        }
        if !self.fields.is_empty() {
            lp = lp.fields(&self.field_selector());
        }
        lp
    }
}

fn join_selector(map: &BTreeMap<String, String>) -> String {
    map.iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// A change observed on a watched resource type
#[derive(Clone, Debug)]
pub enum WatchEvent {
    /// A relist is starting; objects not re-applied before `Synced` are gone
    Restarted,
    /// Object created or updated
    Applied(DynamicObject),
    /// Object deleted
    Deleted(DynamicObject),
    /// The relist finished
    Synced,
}

/// Untyped access to one cluster's API server
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch one object
    async fn get(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<DynamicObject>;

    /// List objects, across all namespaces when `namespace` is `None`
    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        selector: &ListSelector,
    ) -> Result<Vec<DynamicObject>>;

    /// Create an object
    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace an object; a stale `resourceVersion` is a conflict
    async fn replace(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace the status subresource; a stale `resourceVersion` is a conflict
    async fn replace_status(&self, ar: &ApiResource, obj: &DynamicObject)
        -> Result<DynamicObject>;

    /// Apply a JSON merge patch
    async fn patch(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject>;

    /// Delete one object
    async fn delete(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
        propagation: Option<PropagationPolicy>,
    ) -> Result<()>;

    /// Delete every matching object in a namespace
    async fn delete_collection(
        &self,
        ar: &ApiResource,
        namespace: &str,
        selector: &ListSelector,
    ) -> Result<()>;

    /// Liveness probe; a healthy server answers `ok`
    async fn healthz(&self) -> Result<String>;

    /// Watch a resource type. The stream starts with a full relist.
    fn watch(&self, ar: &ApiResource, namespace: Option<&str>)
        -> BoxStream<'static, Result<WatchEvent>>;
}

/// [`ObjectStore`] backed by a kube client
pub struct KubeObjectStore {
    client: Client,
    cluster: String,
}

impl KubeObjectStore {
    /// Wrap a client for the named cluster
    pub fn new(client: Client, cluster: impl Into<String>) -> Self {
        Self {
            client,
            cluster: cluster.into(),
        }
    }

    fn api(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if !ns.is_empty() => Api::namespaced_with(self.client.clone(), ns, ar),
            _ => Api::all_with(self.client.clone(), ar),
        }
    }

    fn map_err(&self, ar: &ApiResource, key: String, e: kube::Error) -> Error {
        match e {
            kube::Error::Api(resp) => match resp.code {
                404 => Error::not_found(&self.cluster, &ar.kind, key),
                409 => Error::conflict(&self.cluster, &ar.kind, key, resp.message),
                422 => Error::invalid(&self.cluster, &ar.kind, key, resp.message),
                _ => kube::Error::Api(resp).into(),
            },
            other => other.into(),
        }
    }
}

fn object_key(obj: &DynamicObject) -> String {
    format!(
        "{}/{}",
        obj.metadata.namespace.as_deref().unwrap_or_default(),
        obj.metadata.name.as_deref().unwrap_or_default()
    )
}

fn with_types(mut obj: DynamicObject, ar: &ApiResource) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
        });
    }
    obj
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<DynamicObject> {
        self.api(ar, Some(namespace))
            .get(name)
            .await
            .map(|o| with_types(o, ar))
            .map_err(|e| self.map_err(ar, format!("{}/{}", namespace, name), e))
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        selector: &ListSelector,
    ) -> Result<Vec<DynamicObject>> {
        let list = self
            .api(ar, namespace)
            .list(&selector.list_params())
            .await
            .map_err(|e| self.map_err(ar, namespace.unwrap_or_default().to_string(), e))?;
        Ok(list.items.into_iter().map(|o| with_types(o, ar)).collect())
    }

    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        self.api(ar, obj.metadata.namespace.as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map(|o| with_types(o, ar))
            .map_err(|e| self.map_err(ar, object_key(obj), e))
    }

    async fn replace(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        self.api(ar, obj.metadata.namespace.as_deref())
            .replace(&name, &PostParams::default(), obj)
            .await
            .map(|o| with_types(o, ar))
            .map_err(|e| self.map_err(ar, object_key(obj), e))
    }

    async fn replace_status(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        // The merge body carries metadata.resourceVersion, so the server
        // still rejects stale writes with 409.
        let name = obj.metadata.name.clone().unwrap_or_default();
        self.api(ar, obj.metadata.namespace.as_deref())
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(obj))
            .await
            .map(|o| with_types(o, ar))
            .map_err(|e| self.map_err(ar, object_key(obj), e))
    }

    async fn patch(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject> {
        self.api(ar, Some(namespace))
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map(|o| with_types(o, ar))
            .map_err(|e| self.map_err(ar, format!("{}/{}", namespace, name), e))
    }

    async fn delete(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
        propagation: Option<PropagationPolicy>,
    ) -> Result<()> {
        let dp = DeleteParams {
            propagation_policy: propagation,
            ..Default::default()
        };
        self.api(ar, Some(namespace))
            .delete(name, &dp)
            .await
            .map(|_| ())
            .map_err(|e| self.map_err(ar, format!("{}/{}", namespace, name), e))
    }

    async fn delete_collection(
        &self,
        ar: &ApiResource,
        namespace: &str,
        selector: &ListSelector,
    ) -> Result<()> {
        self.api(ar, Some(namespace))
            .delete_collection(&DeleteParams::background(), &selector.list_params())
            .await
            .map(|_| ())
            .map_err(|e| self.map_err(ar, namespace.to_string(), e))
    }

    async fn healthz(&self) -> Result<String> {
        let request = http::Request::get("/healthz")
            .body(Vec::new())
            .map_err(|e| Error::internal_with_context("healthz", e.to_string()))?;
        Ok(self.client.request_text(request).await?)
    }

    fn watch(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
    ) -> BoxStream<'static, Result<WatchEvent>> {
        let api = self.api(ar, namespace);
        let cluster = self.cluster.clone();
        let kind = ar.kind.clone();
        watcher(api, watcher::Config::default())
            .default_backoff()
            .map(move |event| match event {
                Ok(watcher::Event::Init) => Ok(WatchEvent::Restarted),
                Ok(watcher::Event::InitApply(o)) | Ok(watcher::Event::Apply(o)) => {
                    Ok(WatchEvent::Applied(o))
                }
                Ok(watcher::Event::Delete(o)) => Ok(WatchEvent::Deleted(o)),
                Ok(watcher::Event::InitDone) => Ok(WatchEvent::Synced),
                Err(e) => Err(Error::internal_with_context(
                    "watch",
                    format!("{} watch in cluster {} failed: {}", kind, cluster, e),
                )),
            })
            .boxed()
    }
}
