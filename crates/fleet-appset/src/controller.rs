//! AppSet controller.
//!
//! Runs against the home cluster and fans out to the fleet. Each pass walks
//! check-deletion → add-finalizer → apply-spec → apply-status →
//! delete-unexpected; a step may stop the pass with an action for the queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use fleet_cluster::{ClusterHandle, FleetRegistry, ListSelector};
use fleet_common::crd::{
    AdvDeployment, AdvDeploymentAggrStatus, AdvDeploymentStatus, AppSet, AppSetStatus, AppStatus,
    WarnEvent,
};
use fleet_common::events::{actions, reasons, EventPublisher};
use fleet_common::fanout::{combine_errors, partition, scatter_gather};
use fleet_common::retry::{retry_on_conflict, RetryConfig};
use fleet_common::{Error, ObjectKey, Result, FINALIZER, WAIT_ALL_READY_ANNOTATION};
use fleet_queue::{Action, Reconciler};

use crate::expand;
use crate::status::{aggregate, unchanged, warn_events, ClusterChild, FleetStatus};
use crate::zone::{unexpected, zone_safe_unexpected, Placement};

/// Requeue delay after a change
pub const REQUEUE_AFTER: Duration = Duration::from_secs(5);

/// Requeue delay after a failed deletion fan-out
pub const REQUEUE_AFTER_ERROR: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct PassState {
    /// Status computed by apply-status
    status: Option<FleetStatus>,
    /// Step error that did not stop the pass
    error: Option<Error>,
}

enum Flow {
    Next,
    Stop(Action),
}

/// Reconciles AppSets on the home cluster into per-cluster AdvDeployments
pub struct AppSetReconciler {
    home: Arc<ClusterHandle>,
    fleet: Arc<FleetRegistry>,
    events: Arc<dyn EventPublisher>,
}

impl AppSetReconciler {
    /// Reconciler reading AppSets from `home` and writing to `fleet`
    pub fn new(
        home: Arc<ClusterHandle>,
        fleet: Arc<FleetRegistry>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self { home, fleet, events }
    }

    async fn event(&self, app: &AppSet, type_: EventType, reason: &str, action: &str, note: String) {
        self.events
            .publish(&app.object_ref(&()), type_, reason, action, Some(note))
            .await;
    }

    // Deletes the child from every connected cluster. Returns whether any
    // cluster still had one, plus the per-cluster failures.
    async fn delete_everywhere(&self, key: &ObjectKey) -> (bool, Vec<(String, Error)>) {
        let names: Vec<String> = self
            .fleet
            .get_all_connected()
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        let gathered = scatter_gather(names, |name| async move {
            let handle = self.fleet.get_connected_with_name(&name)?;
            match handle
                .delete::<AdvDeployment>(&key.namespace, &key.name, None)
                .await
            {
                Ok(()) => {
                    debug!(cluster = %name, "child deleted");
                    Ok(true)
                }
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await;
        let (ok, failed) = partition(gathered);
        (ok.iter().any(|(_, deleted)| *deleted), failed)
    }

    async fn check_deletion(&self, key: &ObjectKey, app: Option<&AppSet>) -> Result<Flow> {
        if let Some(app) = app {
            if app.metadata.deletion_timestamp.is_none() {
                return Ok(Flow::Next);
            }
        }

        let (deleted, failed) = self.delete_everywhere(key).await;
        if let Some(e) = combine_errors("delete_children", &failed) {
            error!(error = %e, "child deletion failed");
            return Ok(Flow::Stop(Action::requeue_after(REQUEUE_AFTER_ERROR)));
        }
        let Some(app) = app else {
            return Ok(Flow::Stop(Action::Done));
        };
        if deleted {
            self.event(
                app,
                EventType::Normal,
                reasons::DELETING,
                actions::DELETE,
                "Deleting per-cluster AdvDeployments".to_string(),
            )
            .await;
            return Ok(Flow::Stop(Action::requeue_after(REQUEUE_AFTER)));
        }

        if has_finalizer(app) {
            info!("children gone, removing finalizer");
            self.set_finalizers(key, without_finalizer(app)).await?;
        }
        Ok(Flow::Stop(Action::Done))
    }

    async fn set_finalizers(&self, key: &ObjectKey, finalizers: Vec<String>) -> Result<()> {
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        match self
            .home
            .patch::<AppSet>(&key.namespace, &key.name, &patch)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn add_finalizer(&self, key: &ObjectKey, app: &AppSet) -> Result<Flow> {
        if has_finalizer(app) {
            return Ok(Flow::Next);
        }
        let mut finalizers = app.finalizers().to_vec();
        finalizers.push(FINALIZER.to_string());
        self.set_finalizers(key, finalizers).await?;
        debug!("finalizer added");
        Ok(Flow::Stop(Action::Done))
    }

    async fn apply_child(&self, app: &AppSet, cluster: String) -> Result<bool> {
        let handle = self.fleet.get_connected_with_name(&cluster)?;
        let Some(target) = app
            .spec
            .cluster_topology
            .clusters
            .iter()
            .find(|c| c.name == cluster)
        else {
            return Ok(false);
        };
        let desired = expand::build(app, target);
        let (namespace, name) = (
            desired.namespace().unwrap_or_default(),
            desired.name_any(),
        );

        let current = match handle.get::<AdvDeployment>(&namespace, &name).await {
            Ok(current) => current,
            Err(e) if e.is_not_found() => {
                let mut created = handle.create(&desired).await?;
                created.status = Some(AdvDeploymentStatus {
                    aggr_status: AdvDeploymentAggrStatus {
                        status: AppStatus::Installing,
                        ..Default::default()
                    },
                    ..Default::default()
                });
                if let Err(e) = handle.update_status(&created).await {
                    warn!(cluster = %cluster, error = %e, "initial child status not written");
                }
                info!(cluster = %cluster, "child created");
                return Ok(true);
            }
            Err(e) => return Err(e),
        };
        if !expand::differs(&current, &desired) {
            return Ok(false);
        }

        let handle = handle.as_ref();
        let (namespace, name) = (namespace.as_str(), name.as_str());
        let desired = &desired;
        let mut seed = Some(current);
        retry_on_conflict(&RetryConfig::conflict(), "update_child", move || {
            let cached = seed.take();
            async move {
                let mut current = match cached {
                    Some(c) => c,
                    None => handle.get::<AdvDeployment>(namespace, name).await?,
                };
                if !expand::differs(&current, desired) {
                    return Ok(());
                }
                expand::merge_into(&mut current, desired);
                handle.update(&current).await.map(|_| ())
            }
        })
        .await?;
        info!(cluster = %cluster, "child updated");
        Ok(true)
    }

    async fn apply_spec(&self, app: &AppSet, state: &mut PassState) -> Flow {
        let gathered = scatter_gather(app.spec.topology_names(), |cluster| {
            self.apply_child(app, cluster)
        })
        .await;
        let (ok, failed) = partition(gathered);
        if let Some(e) = combine_errors("apply_spec", &failed) {
            error!(error = %e, "applying children failed");
            state.error = Some(e);
        }
        if ok.iter().any(|(_, changed)| *changed) {
            return Flow::Stop(Action::requeue_after(REQUEUE_AFTER));
        }
        Flow::Next
    }

    async fn read_children(&self, app: &AppSet) -> Vec<ClusterChild> {
        let (namespace, name) = (app.namespace().unwrap_or_default(), app.name_any());
        let gathered = scatter_gather(app.spec.topology_names(), |cluster| {
            let (namespace, name) = (namespace.as_str(), name.as_str());
            async move {
                let handle = self.fleet.get_connected_with_name(&cluster)?;
                match handle.get::<AdvDeployment>(namespace, name).await {
                    Ok(adv) => Ok(Some(ClusterChild { cluster, adv })),
                    Err(e) if e.is_not_found() => {
                        warn!(cluster = %cluster, "child not found, cache may lag");
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
        })
        .await;
        let (ok, failed) = partition(gathered);
        if let Some(e) = combine_errors("read_children", &failed) {
            warn!(error = %e, "some children could not be read");
        }
        ok.into_iter().filter_map(|(_, child)| child).collect()
    }

    async fn read_warn_events(&self, app: &AppSet) -> Vec<WarnEvent> {
        let namespace = app.namespace().unwrap_or_default();
        let selector = ListSelector::everything().field("type", "Warning");
        let gathered = scatter_gather(app.spec.topology_names(), |cluster| {
            let (namespace, selector) = (namespace.as_str(), &selector);
            async move {
                let handle = self.fleet.get_connected_with_name(&cluster)?;
                handle.list::<Event>(Some(namespace), selector).await
            }
        })
        .await;
        let (ok, failed) = partition(gathered);
        if let Some(e) = combine_errors("read_events", &failed) {
            warn!(error = %e, "some cluster events could not be read");
        }
        warn_events(
            &app.name_any(),
            ok.into_iter().flat_map(|(_, events)| events),
        )
    }

    async fn apply_status(&self, key: &ObjectKey, app: &AppSet, state: &mut PassState) -> Result<Flow> {
        let children = self.read_children(app).await;
        let mut computed = aggregate(app, &children);
        if !computed.is_running() {
            computed.aggr_status.warn_events = self.read_warn_events(app).await;
        }

        let was_running = app
            .status
            .as_ref()
            .is_some_and(|s| s.aggr_status.status.is_running());
        if unchanged(app, &computed) {
            debug!("status unchanged");
            state.status = Some(computed);
            return Ok(Flow::Next);
        }

        let handle = self.home.as_ref();
        let (namespace, name) = (key.namespace.as_str(), key.name.as_str());
        let target = &computed;
        let mut seed = Some(app.clone());
        retry_on_conflict(&RetryConfig::conflict(), "update_status", move || {
            let cached = seed.take();
            async move {
                let mut current = match cached {
                    Some(c) => c,
                    None => handle.get::<AppSet>(namespace, name).await?,
                };
                if unchanged(&current, target) {
                    return Ok(());
                }
                current.status = Some(AppSetStatus {
                    observed_generation: target.observed_generation,
                    last_update_time: Some(Time(chrono::Utc::now())),
                    aggr_status: target.aggr_status.clone(),
                });
                handle.update_status(&current).await.map(|_| ())
            }
        })
        .await?;
        info!(status = %computed.aggr_status.status, "status updated");

        if computed.is_running() && !was_running {
            self.event(
                app,
                EventType::Normal,
                reasons::RUNNING,
                actions::RECONCILE,
                format!("{} replicas available", computed.aggr_status.available),
            )
            .await;
        }
        state.status = Some(computed);
        Ok(Flow::Next)
    }

    async fn placements(&self, key: &ObjectKey) -> Vec<Placement> {
        let names: Vec<String> = self
            .fleet
            .get_all()
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        let gathered = scatter_gather(names, |cluster| async move {
            let handle = self.fleet.get_with_name(&cluster)?;
            match handle.get::<AdvDeployment>(&key.namespace, &key.name).await {
                Ok(adv) => Ok(Some(Placement::of(&cluster, &adv))),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await;
        let (ok, failed) = partition(gathered);
        if let Some(e) = combine_errors("placements", &failed) {
            warn!(error = %e, "some clusters could not be checked for orphans");
        }
        ok.into_iter().filter_map(|(_, p)| p).collect()
    }

    async fn delete_unexpected(&self, key: &ObjectKey, app: &AppSet, state: &PassState) {
        let running = state.status.as_ref().is_some_and(FleetStatus::is_running);
        let topology = &app.spec.cluster_topology.clusters;
        let orphans = if running {
            unexpected(topology, &self.placements(key).await)
        } else if !wait_all_ready(app) {
            zone_safe_unexpected(topology, &self.placements(key).await)
        } else {
            return;
        };

        for cluster in orphans {
            let result = match self.fleet.get_connected_with_name(&cluster) {
                Ok(handle) => {
                    handle
                        .delete::<AdvDeployment>(&key.namespace, &key.name, None)
                        .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    info!(cluster = %cluster, "unexpected child deleted");
                    self.event(
                        app,
                        EventType::Normal,
                        reasons::UNEXPECTED_DELETED,
                        actions::DELETE,
                        format!("Deleted AdvDeployment from cluster {}", cluster),
                    )
                    .await;
                }
                Err(e) => error!(cluster = %cluster, error = %e, "unexpected child delete failed"),
            }
        }
    }
}

#[async_trait]
impl Reconciler for AppSetReconciler {
    #[instrument(skip(self), fields(key = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let app = match self.home.get::<AppSet>(&key.namespace, &key.name).await {
            Ok(app) => Some(app),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        if let Flow::Stop(action) = self.check_deletion(key, app.as_ref()).await? {
            return Ok(action);
        }
        let Some(app) = app else {
            return Ok(Action::Done);
        };
        let mut state = PassState::default();

        if let Flow::Stop(action) = self.add_finalizer(key, &app).await? {
            return Ok(action);
        }
        if let Flow::Stop(action) = self.apply_spec(&app, &mut state).await {
            return match state.error {
                Some(e) => Err(e),
                None => Ok(action),
            };
        }
        if let Err(e) = self.apply_status(key, &app, &mut state).await {
            self.event(
                &app,
                EventType::Warning,
                reasons::APPLY_FAILED,
                actions::RECONCILE,
                format!("Update status failed: {}", e),
            )
            .await;
            return Err(e);
        }
        self.delete_unexpected(key, &app, &state).await;

        match state.error {
            Some(e) => Err(e),
            None => Ok(Action::Done),
        }
    }
}

fn has_finalizer(app: &AppSet) -> bool {
    app.finalizers().iter().any(|f| f == FINALIZER)
}

fn without_finalizer(app: &AppSet) -> Vec<String> {
    app.finalizers()
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect()
}

fn wait_all_ready(app: &AppSet) -> bool {
    app.annotations()
        .get(WAIT_ALL_READY_ANNOTATION)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}
