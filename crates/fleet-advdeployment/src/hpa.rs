//! Autoscaler attached to scalable children.
//!
//! Driven by two annotations on the AdvDeployment: the switch
//! (`{"enable":true,"min_replicas":2,"max_replicas":6}`) and an optional
//! metric list (`[{"resource":"cpu","metric_type":"AverageUtilization","metric_value":"60"}]`).

use std::collections::BTreeMap;

use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
    MetricSpec, MetricTarget, ResourceMetricSource,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde::Deserialize;
use tracing::warn;

use fleet_common::crd::AdvDeployment;
use fleet_common::{APP_LABEL, HPA_ANNOTATION, HPA_METRICS_ANNOTATION};

use crate::config::AdvConfig;
use crate::convert::RenderedObject;

const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

/// Autoscaler switch carried in the annotation
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct HpaSettings {
    /// Attach an autoscaler
    #[serde(default)]
    pub enable: bool,
    /// Upper bound; 0 means twice the declared replicas
    #[serde(default)]
    pub max_replicas: i32,
    /// Lower bound; 0 means the declared replicas
    #[serde(default)]
    pub min_replicas: i32,
}

#[derive(Clone, Debug, Deserialize)]
struct MetricEntry {
    #[serde(default)]
    resource: String,
    #[serde(default)]
    metric_type: String,
    #[serde(default)]
    metric_value: String,
}

/// Settings from the annotation; absent or malformed means disabled
pub fn settings(annotations: &BTreeMap<String, String>) -> HpaSettings {
    let Some(raw) = annotations.get(HPA_ANNOTATION) else {
        return HpaSettings::default();
    };
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(annotation = %raw, error = %e, "malformed autoscaler annotation, treating as disabled");
        HpaSettings::default()
    })
}

/// True when the annotation enables the autoscaler
pub fn enabled(annotations: &BTreeMap<String, String>) -> bool {
    settings(annotations).enable
}

/// Metrics from the metrics annotation; invalid entries are skipped
pub fn parse_metrics(annotations: &BTreeMap<String, String>, object: &str) -> Vec<MetricSpec> {
    let Some(raw) = annotations
        .get(HPA_METRICS_ANNOTATION)
        .filter(|r| !r.is_empty())
    else {
        return Vec::new();
    };
    let entries: Vec<MetricEntry> = match serde_json::from_str(raw) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(annotation = %raw, error = %e, "malformed autoscaler metrics annotation");
            return Vec::new();
        }
    };
    entries
        .iter()
        .filter(|m| m.resource == "cpu" || m.resource == "memory")
        .filter_map(|m| resource_metric(&m.resource, &m.metric_type, &m.metric_value, object))
        .collect()
}

fn resource_metric(resource: &str, metric_type: &str, value: &str, object: &str) -> Option<MetricSpec> {
    let target = match metric_type {
        "AverageUtilization" => {
            let percent = match value.parse::<i32>() {
                Ok(p) if (1..=100).contains(&p) => p,
                _ => {
                    warn!(object, value, "utilization must be a percentage between 1 and 100");
                    return None;
                }
            };
            MetricTarget {
                type_: "Utilization".to_string(),
                average_utilization: Some(percent),
                ..Default::default()
            }
        }
        "AverageValue" => {
            if !value.starts_with(|c: char| c.is_ascii_digit()) {
                warn!(object, value, "average value must be a quantity");
                return None;
            }
            MetricTarget {
                type_: "AverageValue".to_string(),
                average_value: Some(Quantity(value.to_string())),
                ..Default::default()
            }
        }
        other => {
            warn!(object, metric_type = other, "unsupported metric type");
            return None;
        }
    };
    Some(resource_metric_spec(resource, target))
}

fn resource_metric_spec(resource: &str, target: MetricTarget) -> MetricSpec {
    MetricSpec {
        type_: "Resource".to_string(),
        resource: Some(ResourceMetricSource {
            name: resource.to_string(),
            target,
        }),
        ..Default::default()
    }
}

/// CPU and memory utilization targets from the config
pub fn default_metrics(config: &AdvConfig) -> Vec<MetricSpec> {
    [
        ("cpu", config.metric_cpu_utilization),
        ("memory", config.metric_memory_utilization),
    ]
    .into_iter()
    .map(|(resource, percent)| {
        resource_metric_spec(
            resource,
            MetricTarget {
                type_: "Utilization".to_string(),
                average_utilization: Some(percent),
                ..Default::default()
            },
        )
    })
    .collect()
}

/// Name-only autoscaler used to ensure one is absent
pub fn placeholder(target: &RenderedObject) -> HorizontalPodAutoscaler {
    HorizontalPodAutoscaler {
        metadata: ObjectMeta {
            name: Some(target.name()),
            namespace: Some(target.namespace()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// The autoscaler `adv` wants for `target`, or `None` when it should not
/// have one (disabled, or zero declared replicas)
pub fn desired(
    adv: &AdvDeployment,
    target: &RenderedObject,
    config: &AdvConfig,
) -> Option<HorizontalPodAutoscaler> {
    let settings = settings(adv.annotations());
    let replicas = target.replicas();
    if !settings.enable || replicas == 0 || !target.is_scalable() {
        return None;
    }

    let min = if settings.min_replicas > 0 {
        settings.min_replicas
    } else {
        replicas
    };
    let max = if settings.max_replicas > 0 {
        settings.max_replicas
    } else {
        replicas * 2
    };
    let mut metrics = parse_metrics(adv.annotations(), &target.name());
    if metrics.is_empty() {
        metrics = default_metrics(config);
    }

    Some(HorizontalPodAutoscaler {
        metadata: ObjectMeta {
            name: Some(target.name()),
            namespace: Some(target.namespace()),
            labels: Some(BTreeMap::from([
                (APP_LABEL.to_string(), adv.name_any()),
                (INSTANCE_LABEL.to_string(), target.name()),
            ])),
            owner_references: adv.controller_owner_ref(&()).map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some(target.api_version().to_string()),
                kind: target.kind().to_string(),
                name: target.name(),
            },
            min_replicas: Some(min),
            max_replicas: max.max(min),
            metrics: Some(metrics),
            behavior: None,
        }),
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::crd::AdvDeploymentSpec;
    use serde_json::json;

    fn adv(annotations: &[(&str, &str)]) -> AdvDeployment {
        let mut adv = AdvDeployment::new("web", AdvDeploymentSpec::default());
        adv.metadata.namespace = Some("prod".into());
        adv.metadata.uid = Some("adv-uid".into());
        adv.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        adv
    }

    fn deployment(replicas: i32) -> RenderedObject {
        RenderedObject::from_dynamic(
            serde_json::from_value(json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "web-blue", "namespace": "prod"},
                "spec": {"replicas": replicas, "template": {"spec": {"containers": []}}}
            }))
            .expect("dynamic"),
        )
        .expect("deployment")
    }

    #[test]
    fn disabled_or_malformed_annotation_wants_no_autoscaler() {
        let config = AdvConfig::default();
        assert!(desired(&adv(&[]), &deployment(3), &config).is_none());
        assert!(desired(&adv(&[(HPA_ANNOTATION, "{not json")]), &deployment(3), &config).is_none());
        assert!(desired(&adv(&[(HPA_ANNOTATION, r#"{"enable":false}"#)]), &deployment(3), &config)
            .is_none());
        assert!(desired(&adv(&[(HPA_ANNOTATION, r#"{"enable":true}"#)]), &deployment(0), &config)
            .is_none());
    }

    #[test]
    fn bounds_default_to_replicas_and_twice_replicas() {
        let hpa = desired(
            &adv(&[(HPA_ANNOTATION, r#"{"enable":true}"#)]),
            &deployment(3),
            &AdvConfig::default(),
        )
        .expect("enabled");
        let spec = hpa.spec.expect("spec");
        assert_eq!(spec.min_replicas, Some(3));
        assert_eq!(spec.max_replicas, 6);
        assert_eq!(spec.scale_target_ref.kind, "Deployment");
        assert_eq!(spec.scale_target_ref.api_version.as_deref(), Some("apps/v1"));

        let metrics = spec.metrics.expect("metrics");
        assert_eq!(metrics.len(), 2);
        let cpu = metrics[0].resource.as_ref().expect("resource");
        assert_eq!(cpu.name, "cpu");
        assert_eq!(cpu.target.average_utilization, Some(70));
        assert_eq!(hpa.metadata.owner_references.map(|r| r[0].uid.clone()), Some("adv-uid".into()));
    }

    #[test]
    fn annotation_bounds_win_when_set() {
        let hpa = desired(
            &adv(&[(HPA_ANNOTATION, r#"{"enable":true,"min_replicas":2,"max_replicas":9}"#)]),
            &deployment(3),
            &AdvConfig::default(),
        )
        .expect("enabled");
        let spec = hpa.spec.expect("spec");
        assert_eq!(spec.min_replicas, Some(2));
        assert_eq!(spec.max_replicas, 9);
    }

    #[test]
    fn metric_annotation_entries_are_validated() {
        let annotations = BTreeMap::from([(
            HPA_METRICS_ANNOTATION.to_string(),
            json!([
                {"resource": "cpu", "metric_type": "AverageUtilization", "metric_value": "60"},
                {"resource": "memory", "metric_type": "AverageValue", "metric_value": "512Mi"},
                {"resource": "cpu", "metric_type": "AverageUtilization", "metric_value": "140"},
                {"resource": "gpu", "metric_type": "AverageUtilization", "metric_value": "50"},
                {"resource": "memory", "metric_type": "Peak", "metric_value": "1"}
            ])
            .to_string(),
        )]);
        let metrics = parse_metrics(&annotations, "web-blue");
        assert_eq!(metrics.len(), 2);
        assert_eq!(
            metrics[0].resource.as_ref().and_then(|r| r.target.average_utilization),
            Some(60)
        );
        assert_eq!(
            metrics[1].resource.as_ref().and_then(|r| r.target.average_value.clone()),
            Some(Quantity("512Mi".into()))
        );
    }
}
