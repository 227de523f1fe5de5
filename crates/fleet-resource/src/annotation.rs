//! Last-applied configuration annotation.
//!
//! The annotation holds the desired object as it was last written, without
//! the annotation itself and with empty values pruned, gzip-compressed and
//! base64-encoded. Plain JSON annotations written by other tools are still
//! accepted on read.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{Map, Value};

use fleet_common::{Error, Result, LAST_APPLIED_ANNOTATION};

use crate::prune::prune_empty;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// The object as JSON without the last-applied annotation; an annotation map
/// left empty is removed
pub fn without_last_applied(obj: &Value) -> Value {
    let mut stripped = obj.clone();
    if let Some(meta) = stripped.get_mut("metadata").and_then(Value::as_object_mut) {
        let emptied = match meta.get_mut("annotations").and_then(Value::as_object_mut) {
            Some(annotations) => {
                annotations.remove(LAST_APPLIED_ANNOTATION);
                annotations.is_empty()
            }
            None => false,
        };
        if emptied {
            meta.remove("annotations");
        }
    }
    stripped
}

/// Stamp the last-applied annotation onto `obj`
pub fn set_last_applied(obj: &mut Value) -> Result<()> {
    let config = prune_empty(&without_last_applied(obj));
    let raw =
        serde_json::to_vec(&config).map_err(|e| Error::serialization(e.to_string()))?;
    let encoded = encode(&raw)?;

    let Some(root) = obj.as_object_mut() else {
        return Err(Error::serialization("object is not a JSON map"));
    };
    let meta = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(meta) = meta.as_object_mut() else {
        return Err(Error::serialization("metadata is not a JSON map"));
    };
    let annotations = meta
        .entry("annotations")
        .or_insert_with(|| Value::Object(Map::new()));
    if !annotations.is_object() {
        *annotations = Value::Object(Map::new());
    }
    if let Some(annotations) = annotations.as_object_mut() {
        annotations.insert(LAST_APPLIED_ANNOTATION.to_string(), Value::String(encoded));
    }
    Ok(())
}

/// The last-applied configuration recorded on `obj`, if any
pub fn last_applied(obj: &Value) -> Result<Option<Value>> {
    let Some(raw) = obj
        .pointer("/metadata/annotations")
        .and_then(|a| a.get(LAST_APPLIED_ANNOTATION))
        .and_then(Value::as_str)
    else {
        return Ok(None);
    };
    let bytes = decode(raw)?;
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| Error::serialization(format!("last-applied annotation is not JSON: {}", e)))
}

fn encode(raw: &[u8]) -> Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(raw)
        .and_then(|_| encoder.finish())
        .map(|compressed| STANDARD.encode(compressed))
        .map_err(|e| Error::serialization(format!("compress last-applied: {}", e)))
}

fn decode(annotation: &str) -> Result<Vec<u8>> {
    match STANDARD.decode(annotation) {
        Ok(decoded) if decoded.starts_with(&GZIP_MAGIC) => {
            let mut out = Vec::new();
            GzDecoder::new(decoded.as_slice())
                .read_to_end(&mut out)
                .map_err(|e| Error::serialization(format!("decompress last-applied: {}", e)))?;
            Ok(out)
        }
        _ => Ok(annotation.as_bytes().to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment() -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "prod", "labels": {"app": "web"}},
            "spec": {"replicas": 3, "paused": null, "template": {"metadata": {}}}
        })
    }

    #[test]
    fn stamped_annotation_round_trips_without_itself() {
        let mut obj = deployment();
        set_last_applied(&mut obj).expect("stamp");

        let stamped = obj
            .pointer("/metadata/annotations")
            .and_then(|a| a.get(LAST_APPLIED_ANNOTATION))
            .and_then(Value::as_str)
            .expect("annotation present");
        assert!(!stamped.starts_with('{'), "stored compressed");

        let original = last_applied(&obj).expect("decode").expect("present");
        assert_eq!(original["spec"]["replicas"], 3);
        assert!(original["spec"].get("paused").is_none(), "nulls pruned");
        assert!(original["metadata"].get("annotations").is_none());
    }

    #[test]
    fn restamping_is_stable() {
        let mut once = deployment();
        set_last_applied(&mut once).expect("stamp");
        let mut twice = once.clone();
        set_last_applied(&mut twice).expect("restamp");
        assert_eq!(
            last_applied(&once).expect("decode"),
            last_applied(&twice).expect("decode")
        );
    }

    #[test]
    fn plain_json_annotation_is_accepted() {
        let mut obj = deployment();
        obj["metadata"]["annotations"] =
            json!({ LAST_APPLIED_ANNOTATION: r#"{"spec":{"replicas":1}}"# });
        let original = last_applied(&obj).expect("decode").expect("present");
        assert_eq!(original, json!({"spec": {"replicas": 1}}));
    }

    #[test]
    fn missing_annotation_is_first_adoption() {
        assert_eq!(last_applied(&deployment()).expect("decode"), None);
    }

    #[test]
    fn other_annotations_survive_stripping() {
        let mut obj = deployment();
        obj["metadata"]["annotations"] = json!({"team": "edge", LAST_APPLIED_ANNOTATION: "x"});
        let stripped = without_last_applied(&obj);
        assert_eq!(stripped["metadata"]["annotations"], json!({"team": "edge"}));
    }
}
