//! AppSet CRD: one application spread over an explicit cluster topology

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{AppStatus, PodSet, PodSetStatusInfo, PodSpec, WarnEvent};

/// Spec for an AppSet
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "workload.fleet.io",
    version = "v1beta1",
    kind = "AppSet",
    plural = "appsets",
    shortname = "aps",
    namespaced,
    status = "AppSetStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.aggrStatus.status"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.aggrStatus.desired"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.aggrStatus.available"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.aggrStatus.version"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AppSetSpec {
    /// Labels applied to generated children
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Free-form tags
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    /// Total declared replicas across the fleet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Service fronting the application
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    /// Shared pod template and chart
    #[serde(default)]
    pub pod_spec: PodSpec,
    /// Rollout settings
    #[serde(default)]
    pub update_strategy: AppSetUpdateStrategy,
    /// Clusters the application runs in
    #[serde(default)]
    pub cluster_topology: ClusterTopology,
}

/// Rollout settings for an AppSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppSetUpdateStrategy {
    /// Upgrade mechanism name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub upgrade_type: String,
    /// Seconds a pod must be ready before it counts
    #[serde(default)]
    pub min_ready_seconds: i32,
    /// Clusters upgraded first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub canary_clusters: Vec<String>,
    /// Pause the rollout
    #[serde(default)]
    pub paused: bool,
    /// Wait for a human before continuing
    #[serde(default)]
    pub need_waiting_for_confirm: bool,
}

/// Explicit per-cluster placement
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopology {
    /// Target clusters
    #[serde(default)]
    pub clusters: Vec<TargetCluster>,
}

/// One cluster of the topology and the pod sets it runs
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetCluster {
    /// Registry cluster name
    pub name: String,
    /// Tags; `fleet.io/cluster-name` and `fleet.io/available-zone` override
    /// the labels stamped on the per-cluster child
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    /// Pod sets placed in this cluster
    #[serde(default)]
    pub pod_sets: Vec<PodSet>,
}

impl AppSetSpec {
    /// Names of the topology clusters, in declaration order
    pub fn topology_names(&self) -> Vec<String> {
        self.cluster_topology
            .clusters
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }
}

/// Status of an AppSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppSetStatus {
    /// Generation the aggregated status reflects
    #[serde(default)]
    pub observed_generation: i64,
    /// Last time the status was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<Time>,
    /// Aggregated fleet status
    #[serde(default)]
    pub aggr_status: AggrAppSetStatus,
}

/// Observed state of the per-cluster child in one cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAppActual {
    /// Cluster name
    pub name: String,
    /// Desired replicas in this cluster
    #[serde(default)]
    pub desired: i32,
    /// Available replicas in this cluster
    #[serde(default)]
    pub available: i32,
    /// Unavailable replicas in this cluster
    #[serde(default)]
    pub un_available: i32,
    /// Pod set breakdown
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_sets: Vec<PodSetStatusInfo>,
}

/// Status aggregated across every topology cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AggrAppSetStatus {
    /// Fleet-wide state
    #[serde(default)]
    pub status: AppStatus,
    /// Merged version list, e.g. `v1/v2`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Desired replicas
    pub desired: i32,
    /// Available replicas
    pub available: i32,
    /// Unavailable replicas
    pub un_available: i32,
    /// Per-cluster breakdown
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<ClusterAppActual>,
    /// Warning events collected while not running
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warn_events: Vec<WarnEvent>,
}
