//! Chart rendering seam.
//!
//! A renderer turns a chart bundle plus a release name, namespace and raw
//! values into untyped Kubernetes objects. The pipeline only depends on the
//! [`Renderer`] trait; [`ManifestRenderer`] is the implementation shipped with
//! the operator.

use kube::api::DynamicObject;
use minijinja::{context, Environment, UndefinedBehavior};
use serde::Deserialize;
use serde_json::{Map, Value};

use fleet_common::{Error, Result};

#[cfg(test)]
use mockall::automock;

/// Renders a chart bundle into objects
#[cfg_attr(test, automock)]
pub trait Renderer: Send + Sync {
    /// Render `bundle` as release `release` into `namespace` with `values`
    /// (a YAML document)
    fn render(
        &self,
        bundle: &[u8],
        release: &str,
        namespace: &str,
        values: &str,
    ) -> Result<Vec<DynamicObject>>;
}

/// Multi-document YAML manifests with `{{ release }}`, `{{ namespace }}` and
/// `{{ values.<key> }}` placeholders.
///
/// Undefined placeholders are an error. Objects rendered without a namespace
/// land in the release namespace.
pub struct ManifestRenderer {
    env: Environment<'static>,
}

impl Default for ManifestRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl ManifestRenderer {
    /// Renderer with strict undefined handling
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self { env }
    }
}

impl Renderer for ManifestRenderer {
    fn render(
        &self,
        bundle: &[u8],
        release: &str,
        namespace: &str,
        values: &str,
    ) -> Result<Vec<DynamicObject>> {
        if bundle.is_empty() {
            return Err(Error::render(release, "chart bundle is empty"));
        }
        let template = std::str::from_utf8(bundle)
            .map_err(|e| Error::render(release, format!("chart bundle is not UTF-8: {}", e)))?;
        let values = parse_values(release, values)?;

        let rendered = self
            .env
            .render_str(
                template,
                context! {
                    release => release,
                    namespace => namespace,
                    values => values,
                },
            )
            .map_err(|e| Error::render(release, e.to_string()))?;

        let mut objects = Vec::new();
        for doc in serde_yaml::Deserializer::from_str(&rendered) {
            let value = Value::deserialize(doc)
                .map_err(|e| Error::render(release, format!("rendered YAML: {}", e)))?;
            if value.is_null() {
                continue;
            }
            objects.push(to_object(release, namespace, value)?);
        }
        Ok(objects)
    }
}

fn parse_values(release: &str, raw: &str) -> Result<Value> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    let parsed: Value = serde_yaml::from_str(raw)
        .map_err(|e| Error::render(release, format!("values: {}", e)))?;
    match parsed {
        Value::Object(_) => Ok(parsed),
        Value::Null => Ok(Value::Object(Map::new())),
        _ => Err(Error::render(release, "values must be a YAML map")),
    }
}

fn to_object(release: &str, namespace: &str, value: Value) -> Result<DynamicObject> {
    let typed = ["apiVersion", "kind"]
        .iter()
        .all(|f| value.get(f).and_then(Value::as_str).is_some_and(|s| !s.is_empty()));
    if !typed {
        return Err(Error::render(
            release,
            "rendered object is missing apiVersion or kind",
        ));
    }
    let mut obj: DynamicObject = serde_json::from_value(value)
        .map_err(|e| Error::render(release, format!("rendered object: {}", e)))?;
    if obj.metadata.name.as_deref().map_or(true, str::is_empty) {
        return Err(Error::render(release, "rendered object has no name"));
    }
    if obj.metadata.namespace.is_none() {
        obj.metadata.namespace = Some(namespace.to_string());
    }
    Ok(obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHART: &str = r#"
apiVersion: v1
kind: Service
metadata:
  name: {{ release }}-svc
spec:
  ports:
    - port: {{ values.port }}
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: {{ release }}
  namespace: {{ namespace }}
spec:
  replicas: {{ values.replicas }}
  template:
    spec:
      containers:
        - name: web
          image: "web:{{ values.tag }}"
---
"#;

    #[test]
    fn placeholders_are_filled_and_documents_split() {
        let objects = ManifestRenderer::new()
            .render(
                CHART.as_bytes(),
                "web-blue",
                "prod",
                "port: 8080\nreplicas: 2\ntag: v3\n",
            )
            .expect("renders");

        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].metadata.name.as_deref(), Some("web-blue-svc"));
        assert_eq!(objects[0].metadata.namespace.as_deref(), Some("prod"));
        assert_eq!(objects[0].data["spec"]["ports"][0]["port"], 8080);
        assert_eq!(objects[1].types.as_ref().map(|t| t.kind.as_str()), Some("Deployment"));
        assert_eq!(objects[1].data["spec"]["replicas"], 2);
        assert_eq!(
            objects[1].data["spec"]["template"]["spec"]["containers"][0]["image"],
            "web:v3"
        );
    }

    #[test]
    fn undefined_value_is_a_render_error() {
        let err = ManifestRenderer::new()
            .render(CHART.as_bytes(), "web-blue", "prod", "port: 8080")
            .expect_err("replicas is undefined");
        assert!(matches!(err, Error::Render { ref release, .. } if release == "web-blue"));
    }

    #[test]
    fn empty_bundle_is_rejected() {
        assert!(ManifestRenderer::new().render(b"", "r", "prod", "").is_err());
    }

    #[test]
    fn untyped_document_is_rejected() {
        let bundle = b"metadata:\n  name: loose\n";
        assert!(ManifestRenderer::new().render(bundle, "r", "prod", "").is_err());
    }

    #[test]
    fn non_map_values_are_rejected() {
        let bundle = b"apiVersion: v1\nkind: Service\nmetadata:\n  name: a\n";
        assert!(ManifestRenderer::new().render(bundle, "r", "prod", "- 1\n- 2").is_err());
        assert_eq!(
            ManifestRenderer::new()
                .render(bundle, "r", "prod", "")
                .expect("no values needed")
                .len(),
            1
        );
    }
}
