//! Three-way JSON merge patch.
//!
//! Deletions come from original→modified (fields this controller set before
//! and no longer wants); additions and changes come from current→modified.
//! Fields only the server set are left alone. Lists are replaced wholesale
//! unless the desired list is already contained in the live one, which
//! absorbs server-side defaulting inside list elements.

use serde_json::{Map, Value};

use fleet_common::{Error, Result};

use crate::annotation::{last_applied, without_last_applied};
use crate::ignore::{apply_all, IgnoreRule};
use crate::prune::prune_empty;

/// Inputs and output of one diff
#[derive(Clone, Debug, PartialEq)]
pub struct PatchResult {
    /// Last-applied configuration recovered from the live object; `Null`
    /// on first adoption
    pub original: Value,
    /// Live object after ignore rules and pruning
    pub current: Value,
    /// Desired object after ignore rules and pruning
    pub modified: Value,
    /// Merge patch taking `current` to `modified`; `{}` when in sync
    pub patch: Value,
}

impl PatchResult {
    /// True when there is nothing to write
    pub fn is_empty(&self) -> bool {
        self.patch.as_object().is_some_and(Map::is_empty)
    }
}

/// Diff `desired` against `current` under `rules`
pub fn calculate(current: &Value, desired: &Value, rules: &[IgnoreRule]) -> Result<PatchResult> {
    let prepare = |v: &Value| {
        let mut v = v.clone();
        apply_all(rules, &mut v);
        prune_empty(&v)
    };

    let original = match last_applied(current)? {
        Some(o) => prepare(&o),
        None => Value::Null,
    };
    let live = prepare(current);
    let modified = prepare(&without_last_applied(desired));

    if !live.is_object() || !modified.is_object() {
        return Err(Error::serialization("patch inputs must be JSON maps"));
    }

    let mut patch = deletions(&original, &modified);
    merge_into(&mut patch, changes(&live, &modified));

    // A deletion of a field the server already dropped, or a change that
    // merges back to the same document, is not a real diff.
    let has_diff = match &patch {
        Value::Object(m) if m.is_empty() => false,
        _ => {
            let mut patched = live.clone();
            json_patch::merge(&mut patched, &patch);
            patched != live
        }
    };
    if !has_diff {
        patch = Value::Object(Map::new());
    }

    Ok(PatchResult {
        original,
        current: live,
        modified,
        patch,
    })
}

/// True when every field of `desired` is present and equal in `live`;
/// lists must match element-wise with the same length
pub fn contained(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(d), Value::Object(l)) => d.iter().all(|(k, dv)| match l.get(k) {
            Some(lv) => contained(dv, lv),
            None => dv.is_null(),
        }),
        (Value::Array(d), Value::Array(l)) => {
            d.len() == l.len() && d.iter().zip(l).all(|(dv, lv)| contained(dv, lv))
        }
        (Value::Number(d), Value::Number(l)) => d == l || d.as_f64() == l.as_f64(),
        (d, l) => d == l,
    }
}

// Fields present in `original` and absent from `modified`, as nulls.
fn deletions(original: &Value, modified: &Value) -> Value {
    let mut out = Map::new();
    if let (Value::Object(o), Value::Object(m)) = (original, modified) {
        for (k, ov) in o {
            match m.get(k) {
                None => {
                    out.insert(k.clone(), Value::Null);
                }
                Some(mv) if ov.is_object() && mv.is_object() => {
                    let nested = deletions(ov, mv);
                    if nested.as_object().is_some_and(|n| !n.is_empty()) {
                        out.insert(k.clone(), nested);
                    }
                }
                Some(_) => {}
            }
        }
    }
    Value::Object(out)
}

// Fields of `modified` that are absent from or differ in `live`.
fn changes(live: &Value, modified: &Value) -> Value {
    let mut out = Map::new();
    if let (Value::Object(l), Value::Object(m)) = (live, modified) {
        for (k, mv) in m {
            match l.get(k) {
                None => {
                    out.insert(k.clone(), mv.clone());
                }
                Some(lv) if lv.is_object() && mv.is_object() => {
                    let nested = changes(lv, mv);
                    if nested.as_object().is_some_and(|n| !n.is_empty()) {
                        out.insert(k.clone(), nested);
                    }
                }
                Some(lv) if !contained(mv, lv) => {
                    out.insert(k.clone(), mv.clone());
                }
                Some(_) => {}
            }
        }
    }
    Value::Object(out)
}

fn merge_into(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(b), Value::Object(o)) => {
            for (k, v) in o {
                match b.get_mut(k.as_str()) {
                    Some(existing) if existing.is_object() && v.is_object() => {
                        merge_into(existing, v)
                    }
                    _ => {
                        b.insert(k, v);
                    }
                }
            }
        }
        (b, o) => *b = o,
    }
}
