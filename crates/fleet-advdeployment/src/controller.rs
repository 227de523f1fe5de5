//! AdvDeployment controller.
//!
//! Runs against one cluster. Each pass walks an ordered list of steps:
//! check-deletion → check-type → apply-resources → recalculate-status →
//! update-status. A step may stop the pass with an action for the queue;
//! what one step learns for the next travels in [`PassState`].

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use fleet_cluster::ClusterHandle;
use fleet_common::crd::{AdvDeployment, AdvDeploymentStatus, ChartSpec, PodSet, DEPLOY_TYPE_HELM};
use fleet_common::events::{actions, reasons, EventPublisher};
use fleet_common::retry::{retry_on_conflict, RetryConfig};
use fleet_common::{Error, ObjectKey, Result};
use fleet_queue::{Action, Reconciler};
use fleet_resource::{reconcile, ReconcileOption};

use crate::config::{AdvConfig, REQUEUE_AFTER};
use crate::convert::RenderedObject;
use crate::hpa;
use crate::render::Renderer;
use crate::status::{recalculate, Recalculated};

/// What the steps of one pass share
#[derive(Debug, Default)]
struct PassState {
    /// `Kind:namespace/name` of every child applied this pass
    owners: Vec<String>,
    /// Aggregate computed by recalculate-status
    recalculated: Option<Recalculated>,
}

enum Flow {
    Next,
    Stop(Action),
}

/// Reconciles AdvDeployments on one cluster
pub struct AdvDeploymentReconciler {
    handle: Arc<ClusterHandle>,
    renderer: Arc<dyn Renderer>,
    events: Arc<dyn EventPublisher>,
    config: AdvConfig,
}

impl AdvDeploymentReconciler {
    /// Reconciler bound to `handle`
    pub fn new(
        handle: Arc<ClusterHandle>,
        renderer: Arc<dyn Renderer>,
        events: Arc<dyn EventPublisher>,
        config: AdvConfig,
    ) -> Self {
        Self {
            handle,
            renderer,
            events,
            config,
        }
    }

    async fn warn_event(&self, adv: &AdvDeployment, reason: &str, action: &str, note: String) {
        self.events
            .publish(&adv.object_ref(&()), EventType::Warning, reason, action, Some(note))
            .await;
    }

    fn check_deletion(&self, adv: &AdvDeployment) -> Flow {
        if adv.metadata.deletion_timestamp.is_some() {
            debug!("being deleted, children are garbage collected");
            return Flow::Stop(Action::Done);
        }
        Flow::Next
    }

    async fn check_type(&self, adv: &AdvDeployment) -> Flow {
        match validate(adv) {
            Ok(()) => Flow::Next,
            Err(message) => {
                warn!(error = %message, "check failed");
                self.warn_event(
                    adv,
                    reasons::INVALID_SPEC,
                    actions::RECONCILE,
                    format!("Check failed: {}", message),
                )
                .await;
                Flow::Stop(Action::requeue_after(REQUEUE_AFTER))
            }
        }
    }

    async fn apply_resources(&self, adv: &AdvDeployment, state: &mut PassState) -> Result<Flow> {
        let namespace = adv.namespace().unwrap_or_default();
        let mut objects = Vec::new();
        for pod_set in &adv.spec.topology.pod_sets {
            let bundle = chart_for(pod_set, adv)
                .and_then(|c| c.raw_chart.as_ref())
                .map(|b| b.0.as_slice())
                .unwrap_or_default();
            let rendered =
                self.renderer
                    .render(bundle, &pod_set.name, &namespace, &pod_set.raw_values)?;
            objects.extend(rendered);
        }

        let autoscaled = hpa::enabled(adv.annotations());
        let mut changed = 0usize;
        for obj in objects {
            let mut obj = RenderedObject::from_dynamic(obj)?;
            obj.apply_defaults(&self.config);
            obj.adopt(adv);
            state.owners.push(obj.owner_entry());

            if obj
                .reconcile(&self.handle, obj.option(&self.config, autoscaled))
                .await?
            {
                changed += 1;
            }
            if obj.is_scalable() {
                if let Err(e) = self.apply_autoscaler(adv, &obj).await {
                    warn!(object = %obj.owner_entry(), error = %e, "autoscaler reconcile failed");
                }
            }
        }

        if changed > 0 {
            info!(changed, "children applied");
            self.events
                .publish(
                    &adv.object_ref(&()),
                    EventType::Normal,
                    reasons::RESOURCE_APPLIED,
                    actions::APPLY,
                    Some(format!("{} resources created or updated", changed)),
                )
                .await;
            return Ok(Flow::Stop(Action::requeue_after(REQUEUE_AFTER)));
        }
        Ok(Flow::Next)
    }

    async fn apply_autoscaler(&self, adv: &AdvDeployment, target: &RenderedObject) -> Result<bool> {
        match hpa::desired(adv, target, &self.config) {
            Some(desired) => reconcile(&self.handle, &desired, ReconcileOption::present()).await,
            None => {
                reconcile(&self.handle, &hpa::placeholder(target), ReconcileOption::absent()).await
            }
        }
    }

    async fn recalculate_status(&self, adv: &AdvDeployment, state: &mut PassState) -> Result<Flow> {
        match recalculate(&self.handle, adv, &state.owners).await? {
            Some(recalculated) => {
                state.recalculated = Some(recalculated);
                Ok(Flow::Next)
            }
            None => Ok(Flow::Stop(Action::requeue_after(REQUEUE_AFTER))),
        }
    }

    async fn update_status(&self, key: &ObjectKey, state: &PassState) -> Result<Flow> {
        let Some(recalculated) = state.recalculated.as_ref() else {
            return Err(Error::internal_with_context(
                "advdeployment",
                "aggregated status is empty, an earlier step failed",
            ));
        };
        let handle = self.handle.as_ref();
        let (namespace, name) = (key.namespace.as_str(), key.name.as_str());

        let current: AdvDeployment = handle.get(namespace, name).await?;
        if status_matches(&current, recalculated) {
            debug!("status unchanged");
            return Ok(Flow::Next);
        }

        let mut seed = Some(current);
        retry_on_conflict(&RetryConfig::conflict(), "update_status", move || {
            let cached = seed.take();
            async move {
                let mut current = match cached {
                    Some(c) => c,
                    None => handle.get::<AdvDeployment>(namespace, name).await?,
                };
                if status_matches(&current, recalculated) {
                    return Ok(());
                }
                let generation = current.metadata.generation.unwrap_or_default();
                current.status = Some(AdvDeploymentStatus {
                    observed_generation: if recalculated.generation_equal {
                        generation
                    } else {
                        generation - 1
                    },
                    last_update_time: Some(Time(chrono::Utc::now())),
                    aggr_status: recalculated.status.clone(),
                });
                handle.update_status(&current).await.map(|_| ())
            }
        })
        .await?;
        info!(status = %recalculated.status.status, "status updated");
        Ok(Flow::Next)
    }

    async fn delete_unused(&self, state: &PassState) {
        let Some(recalculated) = state.recalculated.as_ref() else {
            return;
        };
        if recalculated.status.desired > recalculated.status.available {
            return;
        }
        for child in &recalculated.unused {
            match child.delete(&self.handle).await {
                Ok(()) => info!(kind = child.kind.as_str(), name = %child.name, "unused child deleted"),
                Err(e) => warn!(kind = child.kind.as_str(), name = %child.name, error = %e, "unused child delete failed"),
            }
        }
    }
}

#[async_trait]
impl Reconciler for AdvDeploymentReconciler {
    #[instrument(skip(self), fields(cluster = %self.handle.name(), key = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let adv: AdvDeployment = match self.handle.get(&key.namespace, &key.name).await {
            Ok(adv) => adv,
            Err(e) if e.is_not_found() => {
                debug!("gone");
                return Ok(Action::Done);
            }
            Err(e) => return Err(e),
        };
        let mut state = PassState::default();

        if let Flow::Stop(action) = self.check_deletion(&adv) {
            return Ok(action);
        }
        if let Flow::Stop(action) = self.check_type(&adv).await {
            return Ok(action);
        }
        match self.apply_resources(&adv, &mut state).await {
            Ok(Flow::Next) => {}
            Ok(Flow::Stop(action)) => return Ok(action),
            Err(e) => {
                self.warn_event(
                    &adv,
                    reasons::APPLY_FAILED,
                    actions::APPLY,
                    format!("Apply resource failed: {}", e),
                )
                .await;
                return Err(e);
            }
        }
        if let Flow::Stop(action) = self.recalculate_status(&adv, &mut state).await? {
            debug!("no workloads to aggregate yet");
            return Ok(action);
        }
        if let Err(e) = self.update_status(key, &state).await {
            self.warn_event(
                &adv,
                reasons::APPLY_FAILED,
                actions::RECONCILE,
                format!("Update status failed: {}", e),
            )
            .await;
            return Err(e);
        }
        self.delete_unused(&state).await;
        Ok(Action::Done)
    }
}

/// Why `adv` cannot be rendered, if it cannot
fn validate(adv: &AdvDeployment) -> std::result::Result<(), String> {
    let key = ObjectKey::of(adv);
    let pod_spec = &adv.spec.pod_spec;
    if pod_spec.deploy_type != DEPLOY_TYPE_HELM {
        return Err(format!(
            "AdvDeployment {} not supported type {:?}",
            key, pod_spec.deploy_type
        ));
    }
    let Some(chart) = pod_spec.chart.as_ref() else {
        return Err(format!("AdvDeployment {} chart is nil", key));
    };
    if !chart.has_source() {
        return Err(format!(
            "AdvDeployment {} chart has neither a raw chart nor a url",
            key
        ));
    }
    Ok(())
}

// A pod set's own chart wins when it names a source.
fn chart_for<'a>(pod_set: &'a PodSet, adv: &'a AdvDeployment) -> Option<&'a ChartSpec> {
    pod_set
        .chart
        .as_ref()
        .filter(|c| c.has_source())
        .or(adv.spec.pod_spec.chart.as_ref())
}

fn status_matches(current: &AdvDeployment, recalculated: &Recalculated) -> bool {
    let generation = current.metadata.generation.unwrap_or_default();
    current.status.as_ref().is_some_and(|s| {
        s.observed_generation == generation && s.aggr_status == recalculated.status
    })
}
