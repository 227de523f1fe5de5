//! Custom Resource Definitions for the fleet orchestrator

mod adv_deployment;
mod appset;
mod types;

pub use adv_deployment::{
    AdvDeployment, AdvDeploymentAggrStatus, AdvDeploymentSpec, AdvDeploymentStatus,
    AdvDeploymentUpdateStrategy, StatefulSetStrategy, Topology,
};
pub use appset::{
    AggrAppSetStatus, AppSet, AppSetSpec, AppSetStatus, AppSetUpdateStrategy, ClusterAppActual,
    ClusterTopology, TargetCluster,
};
pub use types::{
    merge_versions, AppStatus, ChartSpec, ChartUrl, PodSet, PodSetStatusInfo, PodSpec,
    WarnEvent, DEPLOY_TYPE_HELM, VERSION_SEP,
};
