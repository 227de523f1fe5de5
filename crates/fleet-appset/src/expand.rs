//! Expansion of an AppSet into the AdvDeployment one topology cluster runs.

use std::collections::BTreeMap;

use kube::api::ObjectMeta;
use kube::ResourceExt;

use fleet_common::crd::{AdvDeployment, AdvDeploymentSpec, AppSet, TargetCluster, Topology};
use fleet_common::{
    CLUSTER_NAME_LABEL, HPA_ANNOTATION, HPA_METRICS_ANNOTATION, NO_ZONE, ZONE_LABEL,
};

/// Annotations carried from the AppSet to every per-cluster child
pub const PROPAGATED_ANNOTATIONS: [&str; 2] = [HPA_ANNOTATION, HPA_METRICS_ANNOTATION];

/// Labels stamped on the child for `cluster`.
///
/// The AppSet's own labels come first; cluster name and zone are taken from
/// the cluster's meta when set there.
pub fn child_labels(app: &AppSet, cluster: &TargetCluster) -> BTreeMap<String, String> {
    let mut labels = app.spec.labels.clone();
    labels.insert(
        CLUSTER_NAME_LABEL.to_string(),
        cluster
            .meta
            .get(CLUSTER_NAME_LABEL)
            .cloned()
            .unwrap_or_else(|| cluster.name.clone()),
    );
    labels.insert(
        ZONE_LABEL.to_string(),
        cluster
            .meta
            .get(ZONE_LABEL)
            .cloned()
            .unwrap_or_else(|| NO_ZONE.to_string()),
    );
    labels
}

/// Autoscaler annotations present on the AppSet
pub fn child_annotations(app: &AppSet) -> BTreeMap<String, String> {
    PROPAGATED_ANNOTATIONS
        .iter()
        .filter_map(|k| app.annotations().get(*k).map(|v| (k.to_string(), v.clone())))
        .collect()
}

/// The AdvDeployment `cluster` should run for `app`
pub fn build(app: &AppSet, cluster: &TargetCluster) -> AdvDeployment {
    let replicas = cluster.pod_sets.iter().map(|p| p.replica_count()).sum();
    let annotations = child_annotations(app);
    let mut adv = AdvDeployment::new(
        &app.name_any(),
        AdvDeploymentSpec {
            replicas: Some(replicas),
            service_name: app.spec.service_name.clone(),
            pod_spec: app.spec.pod_spec.clone(),
            topology: Topology {
                pod_sets: cluster.pod_sets.clone(),
            },
            ..Default::default()
        },
    );
    adv.metadata = ObjectMeta {
        name: Some(app.name_any()),
        namespace: app.namespace(),
        labels: Some(child_labels(app, cluster)),
        annotations: (!annotations.is_empty()).then_some(annotations),
        ..Default::default()
    };
    adv
}

/// True when `current` differs from `desired` in spec, in a managed label,
/// or in a propagated annotation. Labels and annotations added by others are
/// left alone.
pub fn differs(current: &AdvDeployment, desired: &AdvDeployment) -> bool {
    if current.spec != desired.spec {
        return true;
    }
    let labels_differ = desired
        .labels()
        .iter()
        .any(|(k, v)| current.labels().get(k) != Some(v));
    let annotations_differ = PROPAGATED_ANNOTATIONS
        .iter()
        .any(|k| current.annotations().get(*k) != desired.annotations().get(*k));
    labels_differ || annotations_differ
}

/// Carry the desired spec, managed labels and propagated annotations onto
/// `current`, keeping everything else (finalizers, foreign labels, resource
/// version)
pub fn merge_into(current: &mut AdvDeployment, desired: &AdvDeployment) {
    current.spec = desired.spec.clone();
    let labels = current.labels_mut();
    for (k, v) in desired.labels() {
        labels.insert(k.clone(), v.clone());
    }
    let annotations = current.annotations_mut();
    for key in PROPAGATED_ANNOTATIONS {
        match desired.annotations().get(key) {
            Some(v) => {
                annotations.insert(key.to_string(), v.clone());
            }
            None => {
                annotations.remove(key);
            }
        }
    }
}
