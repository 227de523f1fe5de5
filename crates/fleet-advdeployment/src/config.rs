//! Single-cluster pipeline settings

use std::time::Duration;

/// Requeue delay after a change or a failed check
pub const REQUEUE_AFTER: Duration = Duration::from_secs(5);

/// Defaults applied to rendered workloads and autoscalers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdvConfig {
    /// `revisionHistoryLimit` for Deployments and StatefulSets that leave it unset
    pub revision_history_limit: i32,
    /// `progressDeadlineSeconds` for Deployments that leave it unset
    pub progress_deadline_seconds: i32,
    /// Resolve rejected updates by delete+create
    pub recreate: bool,
    /// Default CPU utilization target, percent
    pub metric_cpu_utilization: i32,
    /// Default memory utilization target, percent
    pub metric_memory_utilization: i32,
}

impl Default for AdvConfig {
    fn default() -> Self {
        Self {
            revision_history_limit: 10,
            progress_deadline_seconds: 600,
            recreate: false,
            metric_cpu_utilization: 70,
            metric_memory_utilization: 70,
        }
    }
}
