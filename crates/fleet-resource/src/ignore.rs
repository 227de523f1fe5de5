//! Fields hidden from the diff.
//!
//! Each rule rewrites both the live and the desired JSON before the patch is
//! computed, so a field the cluster owns never registers as drift.

use serde_json::{json, Value};

/// One field-ignoring transform
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IgnoreRule {
    /// The status sub-document
    Status,
    /// Volume claim template type meta and status, with `volumeMode`
    /// defaulted the way the API server does
    VolumeClaimTemplates,
    /// `spec.replicas`, deferring to an autoscaler
    Replicas,
}

impl IgnoreRule {
    /// Rewrite `obj` in place
    pub fn apply(self, obj: &mut Value) {
        match self {
            IgnoreRule::Status => {
                if let Some(map) = obj.as_object_mut() {
                    map.remove("status");
                }
            }
            IgnoreRule::Replicas => {
                if let Some(spec) = obj.get_mut("spec").and_then(Value::as_object_mut) {
                    spec.remove("replicas");
                }
            }
            IgnoreRule::VolumeClaimTemplates => {
                let Some(templates) = obj
                    .pointer_mut("/spec/volumeClaimTemplates")
                    .and_then(Value::as_array_mut)
                else {
                    return;
                };
                for template in templates.iter_mut().filter_map(Value::as_object_mut) {
                    template.remove("kind");
                    template.remove("apiVersion");
                    let spec = template
                        .entry("spec")
                        .or_insert_with(|| json!({}));
                    if let Some(spec) = spec.as_object_mut() {
                        spec.entry("volumeMode")
                            .or_insert_with(|| Value::String("Filesystem".into()));
                    }
                    template.insert("status".into(), json!({"phase": "Pending"}));
                }
            }
        }
    }
}

/// Apply every rule to `obj`
pub fn apply_all(rules: &[IgnoreRule], obj: &mut Value) {
    for rule in rules {
        rule.apply(obj);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_and_replicas_are_removed() {
        let mut obj = json!({"spec": {"replicas": 5, "paused": false}, "status": {"replicas": 5}});
        apply_all(&[IgnoreRule::Status, IgnoreRule::Replicas], &mut obj);
        assert_eq!(obj, json!({"spec": {"paused": false}}));
    }

    #[test]
    fn volume_claim_templates_are_normalized() {
        let mut live = json!({"spec": {"volumeClaimTemplates": [{
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": {"name": "data"},
            "spec": {"volumeMode": "Filesystem"},
            "status": {"phase": "Bound"}
        }]}});
        let mut desired = json!({"spec": {"volumeClaimTemplates": [{
            "metadata": {"name": "data"},
            "spec": {}
        }]}});

        IgnoreRule::VolumeClaimTemplates.apply(&mut live);
        IgnoreRule::VolumeClaimTemplates.apply(&mut desired);
        assert_eq!(live, desired);
    }
}
