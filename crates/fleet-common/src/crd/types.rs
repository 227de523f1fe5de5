//! Types shared by the AppSet and AdvDeployment CRDs

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use k8s_openapi::api::core::v1::{NodeSelectorTerm, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The only deploy mechanism the single-cluster pipeline understands
pub const DEPLOY_TYPE_HELM: &str = "helm";

/// Separator of merged version lists
pub const VERSION_SEP: &str = "/";

/// Rollout state of an application
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AppStatus {
    /// Every replica is available at the desired generation
    Running,
    /// Moving between clusters
    Migrating,
    /// Shifting traffic ratios
    WorkRatioing,
    /// Changing replica counts
    Scaling,
    /// Rolling out a new version
    Updating,
    /// Not yet converged
    Installing,
    /// No status computed yet
    #[default]
    Unknown,
}

impl AppStatus {
    /// True for [`AppStatus::Running`]
    pub fn is_running(&self) -> bool {
        matches!(self, AppStatus::Running)
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppStatus::Running => "Running",
            AppStatus::Migrating => "Migrating",
            AppStatus::WorkRatioing => "WorkRatioing",
            AppStatus::Scaling => "Scaling",
            AppStatus::Updating => "Updating",
            AppStatus::Installing => "Installing",
            AppStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Remote chart location
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartUrl {
    /// Chart repository URL
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// Chart version
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chart_version: String,
}

/// Chart bundle source: inline bytes or a URL
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartSpec {
    /// Chart bundle, base64 in JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub raw_chart: Option<ByteString>,
    /// Remote chart location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_url: Option<ChartUrl>,
}

impl ChartSpec {
    /// True if the chart names a source to render from
    pub fn has_source(&self) -> bool {
        self.raw_chart.as_ref().is_some_and(|b| !b.0.is_empty())
            || self.chart_url.as_ref().is_some_and(|u| !u.url.is_empty())
    }
}

/// Pod template shared by every pod set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    /// Deploy mechanism; must be `helm`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deploy_type: String,
    /// Pod selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    /// Pod template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,
    /// Global chart, used by pod sets that do not carry their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<ChartSpec>,
}

/// A named subset of an application's pods
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSet {
    /// Subset name, also the release name when rendering
    pub name: String,
    /// Node placement for this subset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector_term: Option<NodeSelectorTerm>,
    /// Replica count (or percentage)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<IntOrString>,
    /// Image override
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    /// Version override
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Chart override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<ChartSpec>,
    /// Values passed to the renderer
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub raw_values: String,
    /// Free-form tags
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}

impl PodSet {
    /// Integer replica count; percentages and unparsable strings count as 0
    pub fn replica_count(&self) -> i32 {
        match &self.replicas {
            Some(IntOrString::Int(v)) => *v,
            Some(IntOrString::String(s)) => s.parse().unwrap_or(0),
            None => 0,
        }
    }
}

/// Observed state of one pod set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSetStatusInfo {
    /// Pod set name (the child workload name)
    pub name: String,
    /// Desired replicas
    pub desired: i32,
    /// Available replicas
    pub available: i32,
    /// Unavailable replicas
    #[serde(default)]
    pub un_available: i32,
    /// Image versions running
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Cluster the pod set runs in
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_name: String,
    /// Updated replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<i32>,
}

/// A warning event surfaced on the fleet status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WarnEvent {
    /// Event message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Reporting component
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_component: String,
    /// Involved object name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Involved object `Kind/name`
    #[serde(default, rename = "object", skip_serializing_if = "String::is_empty")]
    pub sub_object: String,
    /// Occurrence count
    #[serde(default)]
    pub count: i32,
    /// Event reason
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Event type (always Warning here)
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub type_: String,
}

/// Merge version lists into one `/`-separated list without duplicates.
///
/// Tags of the form `v<int>` sort numerically and come first; any other tag
/// sorts lexically after them.
pub fn merge_versions<'a, I>(lists: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut numeric = BTreeSet::new();
    let mut other = BTreeSet::new();
    for tag in lists
        .into_iter()
        .flat_map(|l| l.trim().split(VERSION_SEP))
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        match tag.strip_prefix('v').and_then(|n| n.parse::<u64>().ok()) {
            Some(n) => {
                numeric.insert(n);
            }
            None => {
                other.insert(tag.to_string());
            }
        }
    }
    numeric
        .into_iter()
        .map(|n| format!("v{}", n))
        .chain(other)
        .collect::<Vec<_>>()
        .join(VERSION_SEP)
}
