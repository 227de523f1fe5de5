//! Empty-value pruning applied before diffing.
//!
//! Serialized typed objects carry nulls and empty collections for unset
//! optional fields; the server drops them. Pruning both sides keeps those
//! from showing up as spurious diffs.

use serde_json::{Map, Value};

/// Copy of `value` with nulls, empty strings and empty lists removed from
/// maps, and empty nested maps dropped. Top-level empty maps are kept
/// because `{}` can be meaningful (e.g. `emptyDir: {}`).
pub fn prune_empty(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(prune_map(map)),
        Value::Array(items) => Value::Array(prune_list(items)),
        other => other.clone(),
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn prune_map(map: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in map {
        if is_empty(value) {
            continue;
        }
        match value {
            Value::Object(inner) if inner.is_empty() => {
                out.insert(key.clone(), Value::Object(Map::new()));
            }
            Value::Object(inner) => {
                let pruned = prune_map(inner);
                if !pruned.is_empty() {
                    out.insert(key.clone(), Value::Object(pruned));
                }
            }
            Value::Array(items) => {
                out.insert(key.clone(), Value::Array(prune_list(items)));
            }
            other => {
                out.insert(key.clone(), other.clone());
            }
        }
    }
    out
}

fn prune_list(items: &[Value]) -> Vec<Value> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        if is_empty(item) {
            continue;
        }
        match item {
            // nested lists are flattened
            Value::Array(inner) => out.extend(prune_list(inner)),
            Value::Object(inner) => out.push(Value::Object(prune_map(inner))),
            other => out.push(other.clone()),
        }
    }
    out
}
