//! Kind dispatch for rendered objects.
//!
//! Only the kinds the pipeline knows how to reconcile and aggregate are
//! accepted; anything else a chart renders is an error.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{DynamicObject, ObjectMeta};
use kube::{Resource, ResourceExt};

use fleet_cluster::handle::from_dynamic;
use fleet_cluster::ClusterHandle;
use fleet_common::crd::AdvDeployment;
use fleet_common::{Error, Result, APP_LABEL, CLUSTER_NAME_LABEL};
use fleet_resource::{reconcile, ReconcileOption};

use crate::config::AdvConfig;

/// A rendered child the pipeline can apply
#[derive(Clone, Debug, PartialEq)]
pub enum RenderedObject {
    /// Service
    Service(Service),
    /// Deployment
    Deployment(Deployment),
    /// StatefulSet
    StatefulSet(StatefulSet),
    /// Job
    Job(Job),
}

impl RenderedObject {
    /// Convert an untyped rendered object by its kind
    pub fn from_dynamic(obj: DynamicObject) -> Result<Self> {
        let kind = obj
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .unwrap_or_default();
        match kind.as_str() {
            "Service" => from_dynamic(obj).map(Self::Service),
            "Deployment" => from_dynamic(obj).map(Self::Deployment),
            "StatefulSet" => from_dynamic(obj).map(Self::StatefulSet),
            "Job" => from_dynamic(obj).map(Self::Job),
            _ => Err(Error::validation_for(
                format!(
                    "{}/{}",
                    obj.metadata.namespace.as_deref().unwrap_or_default(),
                    obj.metadata.name.as_deref().unwrap_or_default()
                ),
                format!("unsupported rendered kind {:?}", kind),
            )),
        }
    }

    /// Kind name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Service(_) => "Service",
            Self::Deployment(_) => "Deployment",
            Self::StatefulSet(_) => "StatefulSet",
            Self::Job(_) => "Job",
        }
    }

    /// `apiVersion` the autoscaler targets
    pub fn api_version(&self) -> &'static str {
        match self {
            Self::Service(_) => "v1",
            Self::Deployment(_) | Self::StatefulSet(_) => "apps/v1",
            Self::Job(_) => "batch/v1",
        }
    }

    /// Object metadata
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Self::Service(o) => o.meta(),
            Self::Deployment(o) => o.meta(),
            Self::StatefulSet(o) => o.meta(),
            Self::Job(o) => o.meta(),
        }
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::Service(o) => o.meta_mut(),
            Self::Deployment(o) => o.meta_mut(),
            Self::StatefulSet(o) => o.meta_mut(),
            Self::Job(o) => o.meta_mut(),
        }
    }

    /// Object name
    pub fn name(&self) -> String {
        self.meta().name.clone().unwrap_or_default()
    }

    /// Object namespace
    pub fn namespace(&self) -> String {
        self.meta().namespace.clone().unwrap_or_default()
    }

    /// `Kind:namespace/name`, the owner resource entry recorded in status
    pub fn owner_entry(&self) -> String {
        owner_entry(self.kind(), &self.namespace(), &self.name())
    }

    /// True for kinds an autoscaler can target
    pub fn is_scalable(&self) -> bool {
        matches!(self, Self::Deployment(_) | Self::StatefulSet(_))
    }

    /// Declared replicas; unset counts as 1 for scalable kinds and 0 otherwise
    pub fn replicas(&self) -> i32 {
        match self {
            Self::Deployment(d) => d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
            Self::StatefulSet(s) => s.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
            Self::Service(_) | Self::Job(_) => 0,
        }
    }

    /// Fill the fields the pipeline defaults
    pub fn apply_defaults(&mut self, config: &AdvConfig) {
        match self {
            Self::Deployment(d) => {
                if let Some(spec) = d.spec.as_mut() {
                    spec.revision_history_limit
                        .get_or_insert(config.revision_history_limit);
                    spec.progress_deadline_seconds
                        .get_or_insert(config.progress_deadline_seconds);
                    if spec.selector.match_labels.is_none()
                        && spec.selector.match_expressions.is_none()
                    {
                        spec.selector = LabelSelector {
                            match_labels: spec
                                .template
                                .metadata
                                .as_ref()
                                .and_then(|m| m.labels.clone()),
                            match_expressions: None,
                        };
                    }
                }
            }
            Self::StatefulSet(s) => {
                if let Some(spec) = s.spec.as_mut() {
                    spec.revision_history_limit
                        .get_or_insert(config.revision_history_limit);
                }
            }
            Self::Service(_) | Self::Job(_) => {}
        }
    }

    /// Mark the object as a child of `adv`: controller owner reference plus
    /// the app and cluster-name labels the watches and status lookup key on.
    /// Labels set by the chart win.
    pub fn adopt(&mut self, adv: &AdvDeployment) {
        let owner = adv.controller_owner_ref(&());
        let app = adv.name_any();
        let cluster = adv.labels().get(CLUSTER_NAME_LABEL).cloned();

        let meta = self.meta_mut();
        let labels = meta.labels.get_or_insert_with(BTreeMap::new);
        labels.entry(APP_LABEL.to_string()).or_insert(app);
        if let Some(cluster) = cluster {
            labels
                .entry(CLUSTER_NAME_LABEL.to_string())
                .or_insert(cluster);
        }

        if let Some(owner) = owner {
            let refs = meta.owner_references.get_or_insert_with(Vec::new);
            refs.retain(|r| r.uid != owner.uid && r.controller != Some(true));
            refs.push(owner);
        }
    }

    /// Reconcile option for this kind
    pub fn option(&self, config: &AdvConfig, autoscaled: bool) -> ReconcileOption {
        let mut option = ReconcileOption::present();
        if config.recreate && !matches!(self, Self::Job(_)) {
            option = option.with_recreate();
        }
        if autoscaled && self.is_scalable() {
            option = option.ignoring_replicas();
        }
        option
    }

    /// Converge this object on `handle`; returns whether anything was written
    pub async fn reconcile(&self, handle: &ClusterHandle, option: ReconcileOption) -> Result<bool> {
        match self {
            Self::Service(o) => reconcile(handle, o, option).await,
            Self::Deployment(o) => reconcile(handle, o, option).await,
            Self::StatefulSet(o) => reconcile(handle, o, option).await,
            Self::Job(o) => reconcile(handle, o, option).await,
        }
    }
}

/// `Kind:namespace/name`
pub fn owner_entry(kind: &str, namespace: &str, name: &str) -> String {
    format!("{}:{}/{}", kind, namespace, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::crd::AdvDeploymentSpec;
    use serde_json::json;

    fn rendered(value: serde_json::Value) -> RenderedObject {
        RenderedObject::from_dynamic(serde_json::from_value(value).expect("dynamic"))
            .expect("supported kind")
    }

    fn deployment() -> RenderedObject {
        rendered(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web-blue", "namespace": "prod"},
            "spec": {
                "template": {
                    "metadata": {"labels": {"app": "web", "pod-set": "blue"}},
                    "spec": {"containers": [{"name": "web", "image": "web:v1"}]}
                }
            }
        }))
    }

    fn adv() -> AdvDeployment {
        let mut adv = AdvDeployment::new("web", AdvDeploymentSpec::default());
        adv.metadata.namespace = Some("prod".into());
        adv.metadata.uid = Some("adv-uid".into());
        adv.metadata.labels = Some(BTreeMap::from([(
            CLUSTER_NAME_LABEL.to_string(),
            "east".to_string(),
        )]));
        adv
    }

    #[test]
    fn deployment_defaults_fill_unset_fields_only() {
        let mut obj = deployment();
        obj.apply_defaults(&AdvConfig::default());
        let RenderedObject::Deployment(d) = &obj else {
            panic!("expected deployment");
        };
        let spec = d.spec.as_ref().expect("spec");
        assert_eq!(spec.revision_history_limit, Some(10));
        assert_eq!(spec.progress_deadline_seconds, Some(600));
        assert_eq!(
            spec.selector.match_labels.as_ref().and_then(|l| l.get("pod-set")),
            Some(&"blue".to_string())
        );
        assert_eq!(obj.replicas(), 1);

        let mut explicit = rendered(json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": {"name": "db", "namespace": "prod"},
            "spec": {"replicas": 3, "revisionHistoryLimit": 2, "serviceName": "db",
                     "selector": {"matchLabels": {"app": "db"}},
                     "template": {"spec": {"containers": []}}}
        }));
        explicit.apply_defaults(&AdvConfig::default());
        let RenderedObject::StatefulSet(s) = &explicit else {
            panic!("expected statefulset");
        };
        assert_eq!(s.spec.as_ref().and_then(|s| s.revision_history_limit), Some(2));
        assert_eq!(explicit.replicas(), 3);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "settings", "namespace": "prod"}
        }))
        .expect("dynamic");
        let err = RenderedObject::from_dynamic(obj).expect_err("unsupported");
        assert!(err.to_string().contains("ConfigMap"));
    }

    #[test]
    fn adopted_child_carries_owner_and_labels() {
        let mut obj = deployment();
        obj.adopt(&adv());

        let meta = obj.meta();
        let refs = meta.owner_references.as_ref().expect("owner refs");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].uid, "adv-uid");
        assert_eq!(refs[0].kind, "AdvDeployment");
        assert_eq!(refs[0].controller, Some(true));
        let labels = meta.labels.as_ref().expect("labels");
        assert_eq!(labels.get(APP_LABEL), Some(&"web".to_string()));
        assert_eq!(labels.get(CLUSTER_NAME_LABEL), Some(&"east".to_string()));
        assert_eq!(obj.owner_entry(), "Deployment:prod/web-blue");

        // adopting twice does not stack references
        obj.adopt(&adv());
        assert_eq!(obj.meta().owner_references.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn options_follow_kind_and_config() {
        let config = AdvConfig {
            recreate: true,
            ..AdvConfig::default()
        };
        let option = deployment().option(&config, true);
        assert!(option.recreate);
        assert!(option.ignore_replicas);

        let job = rendered(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": "migrate", "namespace": "prod"},
            "spec": {"template": {"spec": {"containers": []}}}
        }));
        let option = job.option(&config, true);
        assert!(!option.recreate);
        assert!(!option.ignore_replicas);
    }
}
