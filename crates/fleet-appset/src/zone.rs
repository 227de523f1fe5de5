//! Which per-cluster children lie outside the topology and may go.
//!
//! Once the fleet is Running every out-of-topology child is removed. Before
//! that, a child is only removed when its zone keeps serving without it.

use std::collections::BTreeSet;

use fleet_common::crd::{AdvDeployment, AppStatus, TargetCluster};
use fleet_common::ZONE_LABEL;
use kube::ResourceExt;

/// Where a child was found and whether it is still converging
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    /// Cluster holding the child
    pub cluster: String,
    /// Zone label of the child, if any
    pub zone: Option<String>,
    /// Child has not observed its generation or is not Running
    pub installing: bool,
}

impl Placement {
    /// Placement of `adv` found on `cluster`
    pub fn of(cluster: &str, adv: &AdvDeployment) -> Self {
        let installing = match adv.status.as_ref() {
            Some(s) => {
                Some(s.observed_generation) != adv.metadata.generation
                    || s.aggr_status.status != AppStatus::Running
            }
            None => true,
        };
        Self {
            cluster: cluster.to_string(),
            zone: adv.labels().get(ZONE_LABEL).cloned(),
            installing,
        }
    }
}

/// Clusters holding a child that the topology does not name
pub fn unexpected(topology: &[TargetCluster], placements: &[Placement]) -> Vec<String> {
    let expected: BTreeSet<&str> = topology.iter().map(|c| c.name.as_str()).collect();
    placements
        .iter()
        .filter(|p| !expected.contains(p.cluster.as_str()))
        .map(|p| p.cluster.clone())
        .collect()
}

/// Out-of-topology clusters whose child can go before the fleet is Running.
///
/// Nothing is deletable when any topology cluster declares no zone. Children
/// without a zone label are never deleted. Otherwise a child may go when its
/// zone is absent from the topology, or when no other child in its zone is
/// still installing.
pub fn zone_safe_unexpected(topology: &[TargetCluster], placements: &[Placement]) -> Vec<String> {
    let mut zones = BTreeSet::new();
    let mut expected = BTreeSet::new();
    for cluster in topology {
        match cluster.meta.get(ZONE_LABEL).filter(|z| !z.is_empty()) {
            Some(zone) => {
                zones.insert(zone.as_str());
                expected.insert(cluster.name.as_str());
            }
            None => return Vec::new(),
        }
    }

    let zoned: Vec<(&Placement, &str)> = placements
        .iter()
        .filter_map(|p| p.zone.as_deref().map(|z| (p, z)))
        .collect();
    zoned
        .iter()
        .filter(|(p, _)| !expected.contains(p.cluster.as_str()))
        .filter(|(p, zone)| {
            if !zones.contains(zone) {
                return true;
            }
            !zoned
                .iter()
                .any(|(other, z)| z == zone && other.cluster != p.cluster && other.installing)
        })
        .map(|(p, _)| p.cluster.clone())
        .collect()
}
