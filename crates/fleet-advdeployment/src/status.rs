//! Aggregated status of the workloads an AdvDeployment generated.
//!
//! Workloads are found by the `app=<name>` label. Deployments are preferred,
//! then StatefulSets, then Jobs: the first kind with at least one owned
//! object is the one aggregated.

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::api::PropagationPolicy;
use kube::ResourceExt;
use tracing::debug;

use fleet_cluster::{ClusterHandle, ListSelector};
use fleet_common::crd::{
    merge_versions, AdvDeployment, AdvDeploymentAggrStatus, AppStatus, PodSetStatusInfo,
};
use fleet_common::{Result, APP_LABEL};

use crate::convert::owner_entry;

/// Workload kinds that contribute to the aggregate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadKind {
    /// Deployment
    Deployment,
    /// StatefulSet
    StatefulSet,
    /// Job
    Job,
}

impl WorkloadKind {
    /// Kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::Job => "Job",
        }
    }
}

/// A labeled workload that the last apply pass did not produce
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnusedChild {
    /// Kind
    pub kind: WorkloadKind,
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl UnusedChild {
    /// Delete the workload; already gone counts as success
    pub async fn delete(&self, handle: &ClusterHandle) -> Result<()> {
        let propagation = Some(PropagationPolicy::Background);
        let result = match self.kind {
            WorkloadKind::Deployment => {
                handle
                    .delete::<Deployment>(&self.namespace, &self.name, propagation)
                    .await
            }
            WorkloadKind::StatefulSet => {
                handle
                    .delete::<StatefulSet>(&self.namespace, &self.name, propagation)
                    .await
            }
            WorkloadKind::Job => {
                handle
                    .delete::<Job>(&self.namespace, &self.name, propagation)
                    .await
            }
        };
        match result {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

/// Result of one status pass
#[derive(Clone, Debug, PartialEq)]
pub struct Recalculated {
    /// Aggregate to write
    pub status: AdvDeploymentAggrStatus,
    /// Every workload has observed its latest generation
    pub generation_equal: bool,
    /// Workloads to remove once the aggregate is available
    pub unused: Vec<UnusedChild>,
}

// One listed workload reduced to what the aggregate needs
struct Observed {
    info: PodSetStatusInfo,
    updated: i32,
    observed: bool,
}

#[derive(Default)]
struct Tally {
    status: AdvDeploymentAggrStatus,
    updated: i32,
    generation_equal: bool,
}

impl Tally {
    fn new() -> Self {
        Self {
            generation_equal: true,
            ..Default::default()
        }
    }

    fn add(&mut self, w: Observed) {
        self.status.desired += w.info.desired;
        self.status.available += w.info.available;
        self.status.un_available += w.info.un_available;
        self.updated += w.updated;
        self.generation_equal &= w.observed;
        self.status.pod_sets.push(w.info);
    }

    fn finish(mut self, owners: &[String], unused: Vec<UnusedChild>) -> Recalculated {
        let status = &mut self.status;
        status.pod_sets.sort_by(|a, b| a.name.cmp(&b.name));
        status.version = merge_versions(status.pod_sets.iter().map(|p| p.version.as_str()));
        status.owner_resource = owners.to_vec();
        status.status = if status.desired == status.available
            && status.un_available == 0
            && self.generation_equal
            && status.desired == self.updated
        {
            AppStatus::Running
        } else {
            AppStatus::Installing
        };
        Recalculated {
            status: self.status,
            generation_equal: self.generation_equal,
            unused,
        }
    }
}

/// Aggregate the workloads labeled for `adv` on `handle`.
///
/// `owners` is the owner set of the last apply pass; workloads outside it are
/// reported as unused whatever their kind (never when the set is empty). The
/// aggregated kind is the first one holding an owned workload, so a workload
/// left behind by a kind change never stands in for its replacement. Returns
/// `None` when no owned workload exists yet.
pub async fn recalculate(
    handle: &ClusterHandle,
    adv: &AdvDeployment,
    owners: &[String],
) -> Result<Option<Recalculated>> {
    let namespace = adv.namespace().unwrap_or_default();
    let name = adv.name_any();
    let selector = ListSelector::everything().label(APP_LABEL, &name);
    let cluster = handle.name();

    let deployments: Vec<Deployment> = handle.list(Some(&namespace), &selector).await?;
    let statefulsets: Vec<StatefulSet> = handle.list(Some(&namespace), &selector).await?;
    let jobs: Vec<Job> = handle.list(Some(&namespace), &selector).await?;
    let listed = [
        (
            WorkloadKind::Deployment,
            deployments.iter().map(|d| observe_deployment(&name, cluster, d)).collect::<Vec<_>>(),
        ),
        (
            WorkloadKind::StatefulSet,
            statefulsets.iter().map(|s| observe_statefulset(&name, cluster, s)).collect(),
        ),
        (
            WorkloadKind::Job,
            jobs.iter().map(|j| observe_job(&name, cluster, j)).collect(),
        ),
    ];

    let mut unused = Vec::new();
    let mut aggregated: Option<Vec<Observed>> = None;
    for (kind, workloads) in listed {
        let (owned, stale): (Vec<_>, Vec<_>) = workloads
            .into_iter()
            .partition(|w| is_owned(kind, &namespace, &w.info.name, owners));
        unused.extend(stale.into_iter().map(|w| UnusedChild {
            kind,
            namespace: namespace.clone(),
            name: w.info.name,
        }));
        if aggregated.is_none() && !owned.is_empty() {
            aggregated = Some(owned);
        }
    }

    let Some(workloads) = aggregated else {
        debug!(cluster = %cluster, app = %name, unused = unused.len(), "no owned workloads found");
        return Ok(None);
    };
    let mut tally = Tally::new();
    for w in workloads {
        tally.add(w);
    }
    Ok(Some(tally.finish(owners, unused)))
}

fn is_owned(kind: WorkloadKind, namespace: &str, name: &str, owners: &[String]) -> bool {
    if owners.is_empty() {
        return true;
    }
    let entry = owner_entry(kind.as_str(), namespace, name);
    owners.iter().any(|o| *o == entry)
}

fn observe_deployment(app: &str, cluster: &str, d: &Deployment) -> Observed {
    let spec = d.spec.as_ref();
    let status = d.status.clone().unwrap_or_default();
    let updated = status.updated_replicas.unwrap_or_default();
    Observed {
        info: PodSetStatusInfo {
            name: d.name_any(),
            desired: spec.and_then(|s| s.replicas).unwrap_or(1),
            available: status.available_replicas.unwrap_or_default(),
            un_available: status.unavailable_replicas.unwrap_or_default(),
            version: version_of(app, spec.map(|s| &s.template)),
            cluster_name: cluster.to_string(),
            update: Some(updated),
        },
        updated,
        observed: status.observed_generation == d.metadata.generation,
    }
}

fn observe_statefulset(app: &str, cluster: &str, s: &StatefulSet) -> Observed {
    let spec = s.spec.as_ref();
    let status = s.status.clone().unwrap_or_default();
    let updated = status.updated_replicas.unwrap_or_default();
    Observed {
        info: PodSetStatusInfo {
            name: s.name_any(),
            desired: spec.and_then(|s| s.replicas).unwrap_or(1),
            available: status.ready_replicas.unwrap_or_default(),
            un_available: 0,
            version: version_of(app, spec.map(|s| &s.template)),
            cluster_name: cluster.to_string(),
            update: Some(updated),
        },
        updated,
        observed: status.observed_generation == s.metadata.generation,
    }
}

fn observe_job(app: &str, cluster: &str, j: &Job) -> Observed {
    let spec = j.spec.as_ref();
    let succeeded = j
        .status
        .as_ref()
        .and_then(|s| s.succeeded)
        .unwrap_or_default();
    let completions = spec.and_then(|s| s.completions).unwrap_or(1);
    Observed {
        info: PodSetStatusInfo {
            name: j.name_any(),
            desired: completions,
            available: succeeded,
            un_available: 0,
            version: version_of(app, spec.map(|s| &s.template)),
            cluster_name: cluster.to_string(),
            update: Some(succeeded),
        },
        updated: succeeded,
        observed: succeeded >= completions,
    }
}

/// Image tag of the container named like the application
pub fn version_of(app: &str, template: Option<&PodTemplateSpec>) -> String {
    let Some(pod) = template.and_then(|t| t.spec.as_ref()) else {
        return String::new();
    };
    pod.containers
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(app))
        .and_then(|c| c.image.as_deref())
        .and_then(image_tag)
        .unwrap_or_default()
}

fn image_tag(image: &str) -> Option<String> {
    let image = image.split('@').next().unwrap_or(image);
    let last = image.rsplit('/').next().unwrap_or(image);
    last.split_once(':').map(|(_, tag)| tag.to_string())
}
