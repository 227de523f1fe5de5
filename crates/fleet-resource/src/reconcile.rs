//! Desired-vs-observed reconciliation of one object on one cluster.

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Service;
use kube::api::PropagationPolicy;
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, instrument, trace};

use fleet_cluster::{ClusterHandle, Object};
use fleet_common::crd::AdvDeployment;
use fleet_common::metrics::record_resource_operation;
use fleet_common::retry::{retry_on_conflict, RetryConfig};
use fleet_common::{Error, ObjectKey, Result};

use crate::annotation::set_last_applied;
use crate::ignore::IgnoreRule;
use crate::patch::calculate;

/// Whether the object should exist
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DesiredState {
    /// Create or update
    #[default]
    Present,
    /// Delete if found
    Absent,
}

/// Per-call reconcile policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileOption {
    /// Present or absent
    pub desired_state: DesiredState,
    /// Fall back to delete+create when an update is rejected
    pub recreate: bool,
    /// Leave replica counts to an autoscaler when it has scaled above the
    /// declared count
    pub ignore_replicas: bool,
}

impl ReconcileOption {
    /// Ensure the object exists and matches
    pub fn present() -> Self {
        Self::default()
    }

    /// Ensure the object does not exist
    pub fn absent() -> Self {
        Self {
            desired_state: DesiredState::Absent,
            ..Self::default()
        }
    }

    /// Prefer delete+create over a rejected update
    pub fn with_recreate(mut self) -> Self {
        self.recreate = true;
        self
    }

    /// Defer replica counts to an autoscaler
    pub fn ignoring_replicas(mut self) -> Self {
        self.ignore_replicas = true;
        self
    }
}

/// Per-kind policy hooks for [`reconcile`]
pub trait Reconcilable: Object {
    /// Declared replica count for scalable kinds
    fn replicas(&self) -> Option<i32> {
        None
    }

    /// Overwrite the declared replica count
    fn set_replicas(&mut self, _replicas: i32) {}

    /// Rules beyond the status rule that always applies
    fn ignore_rules() -> &'static [IgnoreRule] {
        &[]
    }

    /// Copy server-assigned immutable fields from the live object
    fn prepare_update(&mut self, _current: &Self) {}

    /// Rejected updates are resolved by delete+create with background
    /// propagation
    fn replace_on_rejection() -> bool {
        false
    }
}

impl Reconcilable for Deployment {
    fn replicas(&self) -> Option<i32> {
        Some(self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1))
    }

    fn set_replicas(&mut self, replicas: i32) {
        if let Some(spec) = self.spec.as_mut() {
            spec.replicas = Some(replicas);
        }
    }
}

impl Reconcilable for StatefulSet {
    fn replicas(&self) -> Option<i32> {
        Some(self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1))
    }

    fn set_replicas(&mut self, replicas: i32) {
        if let Some(spec) = self.spec.as_mut() {
            spec.replicas = Some(replicas);
        }
    }

    fn ignore_rules() -> &'static [IgnoreRule] {
        &[IgnoreRule::VolumeClaimTemplates]
    }
}

impl Reconcilable for Service {
    fn prepare_update(&mut self, current: &Self) {
        let live = current.spec.as_ref();
        if let Some(spec) = self.spec.as_mut() {
            spec.cluster_ip = live.and_then(|s| s.cluster_ip.clone());
            spec.cluster_ips = live.and_then(|s| s.cluster_ips.clone());
        }
    }
}

impl Reconcilable for Job {
    fn replace_on_rejection() -> bool {
        true
    }
}

impl Reconcilable for HorizontalPodAutoscaler {}

impl Reconcilable for AdvDeployment {}

/// Converge `desired` on the cluster behind `handle`.
///
/// Returns whether anything was written.
#[instrument(skip_all, fields(cluster = %handle.name(), kind = %K::kind(&()), key = %ObjectKey::of(desired)))]
pub async fn reconcile<K: Reconcilable>(
    handle: &ClusterHandle,
    desired: &K,
    option: ReconcileOption,
) -> Result<bool> {
    let kind = K::kind(&()).to_string();
    let namespace = desired.namespace().unwrap_or_default();
    let name = desired.name_any();

    let current = match handle.get::<K>(&namespace, &name).await {
        Ok(current) => Some(current),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e),
    };

    let current = match (current, option.desired_state) {
        (None, DesiredState::Absent) => return Ok(false),
        (None, DesiredState::Present) => {
            let fresh = stamped(desired)?;
            handle.create(&fresh).await?;
            record_resource_operation(&kind, "create");
            debug!("created");
            return Ok(true);
        }
        (Some(_), DesiredState::Absent) => {
            return match handle.delete::<K>(&namespace, &name, None).await {
                Ok(()) => {
                    record_resource_operation(&kind, "delete");
                    debug!("deleted");
                    Ok(true)
                }
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) => Err(e),
            };
        }
        (Some(current), DesiredState::Present) => current,
    };

    let defer_replicas = option.ignore_replicas && autoscaled(desired, &current);

    if current.labels() == desired.labels() {
        let mut rules = vec![IgnoreRule::Status];
        rules.extend_from_slice(K::ignore_rules());
        if defer_replicas {
            rules.push(IgnoreRule::Replicas);
        }
        let result = calculate(&to_json(&current)?, &to_json(desired)?, &rules)?;
        if result.is_empty() {
            record_resource_operation(&kind, "unchanged");
            trace!("in sync");
            return Ok(false);
        }
        debug!(patch = %result.patch, "drift detected");
    } else {
        debug!("labels differ, forcing update");
    }

    let desired = stamped(desired)?;

    if K::replace_on_rejection() {
        let next = prepared(&desired, &current, defer_replicas);
        update_or_replace(handle, &current, next, Some(PropagationPolicy::Background)).await?;
    } else if option.recreate {
        let next = prepared(&desired, &current, defer_replicas);
        update_or_replace(handle, &current, next, None).await?;
    } else {
        let mut seed = Some(current);
        let (desired, namespace, name) = (&desired, namespace.as_str(), name.as_str());
        retry_on_conflict(&RetryConfig::conflict(), "update", move || {
            let cached = seed.take();
            async move {
                let current = match cached {
                    Some(c) => c,
                    None => handle.get::<K>(namespace, name).await?,
                };
                let defer = option.ignore_replicas && autoscaled(desired, &current);
                handle.update(&prepared(desired, &current, defer)).await
            }
        })
        .await?;
        record_resource_operation(&kind, "update");
        debug!("updated");
    }
    Ok(true)
}

// The autoscaler owns replicas once it has scaled to at least the declared
// count.
fn autoscaled<K: Reconcilable>(desired: &K, current: &K) -> bool {
    match (desired.replicas(), current.replicas()) {
        (Some(want), Some(live)) => want <= live,
        _ => false,
    }
}

fn prepared<K: Reconcilable>(desired: &K, current: &K, defer_replicas: bool) -> K {
    let mut next = desired.clone();
    next.meta_mut().resource_version = current.meta().resource_version.clone();
    next.prepare_update(current);
    if defer_replicas {
        if let Some(live) = current.replicas() {
            next.set_replicas(live);
        }
    }
    next
}

async fn update_or_replace<K: Reconcilable>(
    handle: &ClusterHandle,
    current: &K,
    next: K,
    propagation: Option<PropagationPolicy>,
) -> Result<()> {
    let kind = K::kind(&()).to_string();
    match handle.update(&next).await {
        Ok(_) => {
            record_resource_operation(&kind, "update");
            debug!("updated");
            Ok(())
        }
        Err(e) if e.is_conflict() || e.is_invalid() => {
            debug!(error = %e, "update rejected, recreating");
            let namespace = current.namespace().unwrap_or_default();
            match handle
                .delete::<K>(&namespace, &current.name_any(), propagation)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            let mut fresh = next;
            fresh.meta_mut().resource_version = None;
            fresh.meta_mut().uid = None;
            handle.create(&fresh).await?;
            record_resource_operation(&kind, "recreate");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn to_json<K: Object>(obj: &K) -> Result<Value> {
    serde_json::to_value(obj)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()).to_string(), e.to_string()))
}

fn stamped<K: Object>(obj: &K) -> Result<K> {
    let mut json = to_json(obj)?;
    set_last_applied(&mut json)?;
    serde_json::from_value(json)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()).to_string(), e.to_string()))
}
