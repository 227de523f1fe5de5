//! AdvDeployment CRD: the per-cluster expansion of an AppSet

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{AppStatus, PodSet, PodSetStatusInfo, PodSpec};

/// Spec for an AdvDeployment
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "workload.fleet.io",
    version = "v1beta1",
    kind = "AdvDeployment",
    plural = "advdeployments",
    shortname = "ad",
    namespaced,
    status = "AdvDeploymentStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.aggrStatus.status"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.aggrStatus.desired"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.aggrStatus.available"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.aggrStatus.version"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AdvDeploymentSpec {
    /// Total replicas across pod sets
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
    pub update_strategy: AdvDeploymentUpdateStrategy,
    /// Pod sets to render in this cluster
    #[serde(default)]
    pub topology: Topology,
    /// Revision history kept on generated workloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<i32>,
}

/// Rollout settings for an AdvDeployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdvDeploymentUpdateStrategy {
    /// Upgrade mechanism name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub upgrade_type: String,
    /// StatefulSet specific settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stateful_set_strategy: Option<StatefulSetStrategy>,
    /// Seconds a pod must be ready before it counts
    #[serde(default)]
    pub min_ready_seconds: i32,
    /// Free-form tags
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    /// Pause the rollout
    #[serde(default)]
    pub paused: bool,
    /// Wait for a human before continuing
    #[serde(default)]
    pub need_waiting_for_confirm: bool,
}

/// StatefulSet rollout settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatefulSetStrategy {
    /// Ordinal partition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
    /// Max unavailable during update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,
    /// ReCreate, InPlaceIfPossible or InPlaceOnly
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_update_policy: String,
}

/// Pod sets of one cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    /// Pod sets
    #[serde(default)]
    pub pod_sets: Vec<PodSet>,
}

/// Status of an AdvDeployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdvDeploymentStatus {
    /// Generation the aggregated status reflects
    #[serde(default)]
    pub observed_generation: i64,
    /// Last time the status was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<Time>,
    /// Aggregated status of the generated workloads
    #[serde(default)]
    pub aggr_status: AdvDeploymentAggrStatus,
}

/// Status aggregated over the generated workloads
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdvDeploymentAggrStatus {
    /// `Kind:namespace/name` of every child applied by the last pass
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_resource: Vec<String>,
    /// Rollout state
    #[serde(default)]
    pub status: AppStatus,
    /// Merged image versions, e.g. `v1/v2`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Desired replicas
    pub desired: i32,
    /// Available replicas
    pub available: i32,
    /// Unavailable replicas
    pub un_available: i32,
    /// Per pod set breakdown, sorted by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_sets: Vec<PodSetStatusInfo>,
}

impl AdvDeployment {
    /// True when the status reflects the current generation and is Running
    pub fn is_converged(&self) -> bool {
        let generation = self.metadata.generation.unwrap_or_default();
        self.status.as_ref().is_some_and(|s| {
            s.observed_generation == generation && s.aggr_status.status.is_running()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn crd_uses_fleet_group() {
        let crd = AdvDeployment::crd();
        assert_eq!(crd.spec.group, "workload.fleet.io");
        assert_eq!(crd.spec.names.kind, "AdvDeployment");
    }

    #[test]
    fn convergence_requires_observed_generation_and_running() {
        let mut adv = AdvDeployment::new("web", AdvDeploymentSpec::default());
        adv.metadata.generation = Some(2);
        assert!(!adv.is_converged());

        adv.status = Some(AdvDeploymentStatus {
            observed_generation: 2,
            aggr_status: AdvDeploymentAggrStatus {
                status: AppStatus::Running,
                ..Default::default()
            },
            ..Default::default()
        });
        assert!(adv.is_converged());

        adv.metadata.generation = Some(3);
        assert!(!adv.is_converged());
    }
}
