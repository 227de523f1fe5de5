//! Fleet-level status: per-cluster AdvDeployment statuses folded into one
//! AppSet status, plus the warning events surfaced while it is not Running.

use std::collections::HashSet;

use k8s_openapi::api::core::v1::Event;

use fleet_common::crd::{
    merge_versions, AdvDeployment, AggrAppSetStatus, AppSet, AppStatus, ClusterAppActual,
    WarnEvent,
};

/// Most warning events kept on the status
pub const MAX_WARN_EVENTS: usize = 10;

/// Workload kinds whose events are matched by name prefix
const WORKLOAD_EVENT_KINDS: [&str; 4] = ["Deployment", "StatefulSet", "Pod", "Job"];

/// An AdvDeployment read from one topology cluster
#[derive(Clone, Debug)]
pub struct ClusterChild {
    /// Cluster the child was read from
    pub cluster: String,
    /// The child
    pub adv: AdvDeployment,
}

/// Folded status and the generation it reflects
#[derive(Clone, Debug, PartialEq)]
pub struct FleetStatus {
    /// Generation to record as observed
    pub observed_generation: i64,
    /// Aggregate, without warning events
    pub aggr_status: AggrAppSetStatus,
}

impl FleetStatus {
    /// True when the status is Running
    pub fn is_running(&self) -> bool {
        self.aggr_status.status.is_running()
    }
}

fn child_settled(adv: &AdvDeployment) -> bool {
    adv.status
        .as_ref()
        .is_some_and(|s| Some(s.observed_generation) == adv.metadata.generation)
}

/// Fold the children of `app` into one status.
///
/// Running needs every child to have observed its generation and be Running,
/// total available equal to the declared replicas (or the summed desired when
/// the AppSet declares none) and nothing unavailable. `observed_generation`
/// lags by one until every child has observed its own generation.
pub fn aggregate(app: &AppSet, children: &[ClusterChild]) -> FleetStatus {
    let mut aggr = AggrAppSetStatus::default();
    let mut all_observed = true;
    let mut all_running = true;

    for child in children {
        let status = child
            .adv
            .status
            .as_ref()
            .map(|s| s.aggr_status.clone())
            .unwrap_or_default();
        aggr.version = merge_versions([aggr.version.as_str(), status.version.as_str()]);
        aggr.desired += status.desired;
        aggr.available += status.available;
        aggr.un_available += status.un_available;

        let settled = child_settled(&child.adv);
        all_observed &= settled;
        all_running &= settled && status.status.is_running();

        aggr.clusters.push(ClusterAppActual {
            name: child.cluster.clone(),
            desired: status.desired,
            available: status.available,
            un_available: status.un_available,
            pod_sets: status.pod_sets,
        });
    }

    let replicas = match app.spec.replicas {
        Some(r) => {
            aggr.desired = r;
            r
        }
        None => aggr.desired,
    };
    aggr.status = if all_running && aggr.available == replicas && aggr.un_available == 0 {
        AppStatus::Running
    } else {
        AppStatus::Installing
    };

    let generation = app.metadata.generation.unwrap_or_default();
    FleetStatus {
        observed_generation: if all_observed {
            generation
        } else {
            generation - 1
        },
        aggr_status: aggr,
    }
}

/// True when `event` is about the AdvDeployment `app` or one of its
/// workloads (name prefixed by `<app>-`)
pub fn concerns(event: &Event, app: &str) -> bool {
    let object = &event.involved_object;
    let kind = object.kind.as_deref().unwrap_or_default();
    let name = object.name.as_deref().unwrap_or_default();
    if kind == "AdvDeployment" {
        return name == app;
    }
    WORKLOAD_EVENT_KINDS.contains(&kind)
        && name
            .strip_prefix(app)
            .is_some_and(|rest| rest.starts_with('-'))
}

/// Warning events for `app`: one per reason (first seen wins), sorted by
/// object name descending, at most [`MAX_WARN_EVENTS`]
pub fn warn_events(app: &str, events: impl IntoIterator<Item = Event>) -> Vec<WarnEvent> {
    let mut seen = HashSet::new();
    let mut out: Vec<WarnEvent> = events
        .into_iter()
        .filter(|e| concerns(e, app))
        .filter(|e| seen.insert(e.reason.clone().unwrap_or_default()))
        .map(|e| to_warn_event(&e))
        .collect();
    out.sort_by(|a, b| b.name.cmp(&a.name));
    out.truncate(MAX_WARN_EVENTS);
    out
}

fn to_warn_event(event: &Event) -> WarnEvent {
    let object = &event.involved_object;
    let name = object.name.clone().unwrap_or_default();
    WarnEvent {
        message: event.message.clone().unwrap_or_default(),
        source_component: event
            .source
            .as_ref()
            .and_then(|s| s.component.clone())
            .unwrap_or_default(),
        sub_object: format!("{}/{}", object.kind.as_deref().unwrap_or_default(), name),
        name,
        count: event.count.unwrap_or_default(),
        reason: event.reason.clone().unwrap_or_default(),
        type_: event.type_.clone().unwrap_or_default(),
    }
}

/// True when the stored status of `app` already equals `computed`
pub fn unchanged(app: &AppSet, computed: &FleetStatus) -> bool {
    app.status.as_ref().is_some_and(|s| {
        s.observed_generation == computed.observed_generation
            && s.aggr_status == computed.aggr_status
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::crd::{
        AdvDeploymentAggrStatus, AdvDeploymentSpec, AdvDeploymentStatus, AppSetSpec,
    };
    use k8s_openapi::api::core::v1::ObjectReference;

    fn app(replicas: Option<i32>, generation: i64) -> AppSet {
        let mut app = AppSet::new(
            "web",
            AppSetSpec {
                replicas,
                ..Default::default()
            },
        );
        app.metadata.generation = Some(generation);
        app
    }

    fn child(cluster: &str, status: AppStatus, available: i32, observed: i64) -> ClusterChild {
        let mut adv = AdvDeployment::new("web", AdvDeploymentSpec::default());
        adv.metadata.generation = Some(2);
        adv.status = Some(AdvDeploymentStatus {
            observed_generation: observed,
            last_update_time: None,
            aggr_status: AdvDeploymentAggrStatus {
                status,
                version: if cluster == "east" { "v2" } else { "v1/v2" }.into(),
                desired: 2,
                available,
                ..Default::default()
            },
        });
        ClusterChild {
            cluster: cluster.into(),
            adv,
        }
    }

    fn event(kind: &str, name: &str, reason: &str) -> Event {
        Event {
            involved_object: ObjectReference {
                kind: Some(kind.into()),
                name: Some(name.into()),
                ..Default::default()
            },
            reason: Some(reason.into()),
            type_: Some("Warning".into()),
            message: Some(format!("{} failed", name)),
            count: Some(3),
            ..Default::default()
        }
    }

    /// Story: Two clusters each report two available replicas at their
    /// current generation; the AppSet declares four, so the fleet is Running
    /// with the merged version list.
    #[test]
    fn story_settled_children_aggregate_to_running() {
        let status = aggregate(
            &app(Some(4), 7),
            &[
                child("east", AppStatus::Running, 2, 2),
                child("west", AppStatus::Running, 2, 2),
            ],
        );
        assert!(status.is_running());
        assert_eq!(status.observed_generation, 7);
        assert_eq!(status.aggr_status.version, "v1/v2");
        assert_eq!(status.aggr_status.desired, 4);
        assert_eq!(status.aggr_status.available, 4);
        let clusters: Vec<_> = status.aggr_status.clusters.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(clusters, vec!["east", "west"]);
    }

    #[test]
    fn lagging_child_keeps_fleet_installing_one_generation_behind() {
        let status = aggregate(
            &app(Some(4), 7),
            &[
                child("east", AppStatus::Running, 2, 2),
                child("west", AppStatus::Running, 2, 1),
            ],
        );
        assert_eq!(status.aggr_status.status, AppStatus::Installing);
        assert_eq!(status.observed_generation, 6);
    }

    #[test]
    fn declared_replicas_must_all_be_available() {
        let status = aggregate(&app(Some(6), 1), &[child("east", AppStatus::Running, 2, 2)]);
        assert_eq!(status.aggr_status.status, AppStatus::Installing);
        assert_eq!(status.aggr_status.desired, 6);

        // without a declaration the summed desired is the target
        let status = aggregate(&app(None, 1), &[child("east", AppStatus::Running, 2, 2)]);
        assert!(status.is_running());
    }

    #[test]
    fn events_match_the_app_and_its_workloads_only() {
        assert!(concerns(&event("AdvDeployment", "web", "ApplyFailed"), "web"));
        assert!(!concerns(&event("AdvDeployment", "web-api", "ApplyFailed"), "web"));
        assert!(concerns(&event("Pod", "web-blue-7488db8644-8zmfh", "BackOff"), "web"));
        assert!(!concerns(&event("Pod", "webhook-0", "BackOff"), "web"));
        assert!(!concerns(&event("Service", "web-blue", "Failed"), "web"));
    }

    #[test]
    fn events_are_deduplicated_by_reason_sorted_and_capped() {
        let mut events = vec![
            event("Pod", "web-a-1", "BackOff"),
            event("Pod", "web-b-1", "BackOff"),
            event("Deployment", "web-a", "ProgressDeadlineExceeded"),
            event("Pod", "other-1", "Failed"),
        ];
        for i in 0..12 {
            events.push(event("Pod", &format!("web-x-{:02}", i), &format!("Reason{}", i)));
        }

        let warn = warn_events("web", events);
        assert_eq!(warn.len(), MAX_WARN_EVENTS);
        assert_eq!(warn[0].name, "web-x-11");
        assert!(warn.iter().all(|w| w.reason != "Failed"));
        assert_eq!(warn.iter().filter(|w| w.reason == "BackOff").count(), 0);

        let few = warn_events(
            "web",
            vec![event("Pod", "web-a-1", "BackOff"), event("Pod", "web-b-1", "BackOff")],
        );
        assert_eq!(few.len(), 1);
        assert_eq!(few[0].name, "web-a-1");
        assert_eq!(few[0].sub_object, "Pod/web-a-1");
        assert_eq!(few[0].count, 3);
    }
}
