//! Object comparison against an explicit list of managed fields
//!
//! Only the fields the operator owns for a given [`ObjectKind`] take part in
//! the comparison. Inside those fields the desired value must be *contained*
//! in the observed one, so server-populated defaults (cluster IPs,
//! `terminationMessagePath`, ...) never register as drift. Resource
//! quantities are compared in the canonical form the server stores them in,
//! and owner references by uid. Keys removed from
//! the desired object are caught through the last-applied snapshot the
//! applier stamps on every write.

use crate::error::Result;
use crate::quantity;
use crate::store::ObjectKind;
use kube::api::DynamicObject;
use serde_json::{json, Map, Value};

/// Annotation holding the canonical JSON of the managed fields as last written
pub const LAST_APPLIED_ANNOTATION: &str = "operator.bastion.dev/last-applied";

const LABELS: &str = "/metadata/labels";
const ANNOTATIONS: &str = "/metadata/annotations";
const OWNER_REFERENCES: &str = "/metadata/ownerReferences";

/// Metadata fields managed on every kind
const METADATA_PATHS: [&str; 3] = [LABELS, ANNOTATIONS, OWNER_REFERENCES];

/// Body fields the operator owns, per kind
pub fn managed_paths(kind: ObjectKind) -> &'static [&'static str] {
    match kind {
        ObjectKind::Deployment => &[
            "/spec/replicas",
            "/spec/selector",
            "/spec/template",
            "/spec/strategy",
        ],
        ObjectKind::DaemonSet => &["/spec/selector", "/spec/template", "/spec/updateStrategy"],
        ObjectKind::Service => &["/spec/ports", "/spec/selector", "/spec/type"],
        ObjectKind::Secret => &["/data", "/stringData", "/type"],
        ObjectKind::ConfigMap => &["/data", "/binaryData"],
        ObjectKind::PersistentVolumeClaim => &["/spec/resources/requests"],
        ObjectKind::ServiceAccount => &["/imagePullSecrets"],
        ObjectKind::Role => &["/rules"],
        ObjectKind::RoleBinding => &["/roleRef", "/subjects"],
        ObjectKind::Pod => &[],
        ObjectKind::Platform
        | ObjectKind::Database
        | ObjectKind::Gateway
        | ObjectKind::Server
        | ObjectKind::Enforcer
        | ObjectKind::KubeEnforcer => &["/spec"],
    }
}

/// Whether the observed object differs from the desired one in any managed field.
///
/// `needs_update(kind, d, d)` is `false` for every object `d`.
pub fn needs_update(
    kind: ObjectKind,
    observed: &DynamicObject,
    desired: &DynamicObject,
) -> Result<bool> {
    let observed_value = comparable(kind, observed)?;
    let desired_value = comparable(kind, desired)?;

    for path in managed_paths(kind).iter().chain(METADATA_PATHS.iter()) {
        let wanted = managed_value(&desired_value, path);
        if !field_matches(path, observed_value.pointer(path), wanted.as_ref()) {
            return Ok(true);
        }
    }

    // Containment cannot see removed keys; the snapshot can
    if let Some(previous) = last_applied(observed) {
        if previous != snapshot(kind, desired)? {
            return Ok(true);
        }
    }

    Ok(false)
}

/// Canonical JSON of the managed fields of `object`
pub fn snapshot(kind: ObjectKind, object: &DynamicObject) -> Result<String> {
    let value = comparable(kind, object)?;
    let mut fields = Map::new();
    for path in managed_paths(kind).iter().chain(METADATA_PATHS.iter()) {
        if let Some(v) = managed_value(&value, path) {
            fields.insert((*path).to_string(), v);
        }
    }
    Ok(serde_json::to_string(&Value::Object(fields))?)
}

/// Record the managed fields of `object` in its last-applied annotation
pub fn stamp_last_applied(kind: ObjectKind, object: &mut DynamicObject) -> Result<()> {
    let snapshot = snapshot(kind, object)?;
    object
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(LAST_APPLIED_ANNOTATION.to_string(), snapshot);
    Ok(())
}

/// Copy the managed fields of `desired` onto `observed`.
///
/// Body paths are replaced wholesale (or removed when `desired` lacks them).
/// Labels and annotations are merged: keys set by other actors survive,
/// keys the operator wrote previously but no longer wants are dropped.
/// Owner references are merged by uid.
/// Everything else on `observed`, `resourceVersion` included, is kept.
pub fn overwrite_managed(
    kind: ObjectKind,
    observed: &DynamicObject,
    desired: &DynamicObject,
) -> Result<DynamicObject> {
    let mut target = serde_json::to_value(observed)?;
    let desired_value = serde_json::to_value(desired)?;

    for path in managed_paths(kind) {
        match desired_value.pointer(path) {
            Some(value) => set_path(&mut target, path, value.clone()),
            None => remove_path(&mut target, path),
        }
    }

    let previous: Value = last_applied(observed)
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(Value::Null);
    for path in [LABELS, ANNOTATIONS] {
        let wanted = managed_value(&desired_value, path).unwrap_or_else(|| json!({}));
        let mut merged = target
            .pointer(path)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        if let Some(stale) = previous.get(path).and_then(Value::as_object) {
            for key in stale.keys() {
                if wanted.get(key).is_none() {
                    merged.remove(key);
                }
            }
        }
        if let Some(wanted) = wanted.as_object() {
            for (key, value) in wanted {
                merged.insert(key.clone(), value.clone());
            }
        }
        set_path(&mut target, path, Value::Object(merged));
    }
    if let Some(wanted) = desired_value.pointer(OWNER_REFERENCES).and_then(Value::as_array) {
        let mut owners = target
            .pointer(OWNER_REFERENCES)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for owner in wanted {
            match owners.iter_mut().find(|o| o.get("uid") == owner.get("uid")) {
                Some(existing) => *existing = owner.clone(),
                None => owners.push(owner.clone()),
            }
        }
        set_path(&mut target, OWNER_REFERENCES, Value::Array(owners));
    }

    Ok(serde_json::from_value(target)?)
}

/// Field changes between two objects, as JSON pointers (for logging)
pub fn changed_paths(
    kind: ObjectKind,
    observed: &DynamicObject,
    desired: &DynamicObject,
) -> Result<Vec<String>> {
    let observed_value = comparable(kind, observed)?;
    let desired_value = comparable(kind, desired)?;
    Ok(managed_paths(kind)
        .iter()
        .chain(METADATA_PATHS.iter())
        .filter(|path| {
            let wanted = managed_value(&desired_value, path);
            !field_matches(path, observed_value.pointer(path), wanted.as_ref())
        })
        .map(|path| (*path).to_string())
        .collect())
}

/// Serialized object with its resource quantities in canonical form
fn comparable(kind: ObjectKind, object: &DynamicObject) -> Result<Value> {
    let mut value = serde_json::to_value(object)?;
    quantity::canonicalize_resources(kind, &mut value);
    Ok(value)
}

fn last_applied(object: &DynamicObject) -> Option<String> {
    object
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(LAST_APPLIED_ANNOTATION))
        .cloned()
}

/// Value at `path`, with the snapshot annotation stripped from annotations
fn managed_value(root: &Value, path: &str) -> Option<Value> {
    let value = root.pointer(path)?;
    if path != ANNOTATIONS {
        return Some(value.clone());
    }
    let mut annotations = value.as_object()?.clone();
    annotations.remove(LAST_APPLIED_ANNOTATION);
    Some(Value::Object(annotations))
}

/// Containment per managed path; owner references match by uid, in any order
fn field_matches(path: &str, observed: Option<&Value>, desired: Option<&Value>) -> bool {
    if path != OWNER_REFERENCES {
        return contains(observed, desired);
    }
    let observed: &[Value] = observed
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    desired
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .all(|wanted| {
            observed.iter().any(|actual| {
                actual.get("uid") == wanted.get("uid") && contains(Some(actual), Some(wanted))
            })
        })
}

/// Containment: every value `desired` sets is present and equal in `observed`
fn contains(observed: Option<&Value>, desired: Option<&Value>) -> bool {
    match desired {
        None | Some(Value::Null) => true,
        Some(Value::Object(wanted)) if wanted.is_empty() => true,
        Some(Value::Array(wanted)) if wanted.is_empty() => true,
        Some(Value::Object(wanted)) => match observed {
            Some(Value::Object(actual)) => wanted
                .iter()
                .all(|(key, value)| contains(actual.get(key), Some(value))),
            _ => false,
        },
        Some(Value::Array(wanted)) => match observed {
            Some(Value::Array(actual)) if actual.len() == wanted.len() => actual
                .iter()
                .zip(wanted)
                .all(|(a, w)| contains(Some(a), Some(w))),
            _ => false,
        },
        Some(scalar) => observed == Some(scalar),
    }
}

fn set_path(root: &mut Value, pointer: &str, value: Value) {
    let tokens: Vec<&str> = pointer.split('/').skip(1).collect();
    let Some((last, parents)) = tokens.split_last() else {
        *root = value;
        return;
    };
    let mut current = root;
    for token in parents {
        if !current.is_object() {
            *current = json!({});
        }
        let Some(map) = current.as_object_mut() else {
            return;
        };
        current = map.entry(token.to_string()).or_insert_with(|| json!({}));
    }
    if !current.is_object() {
        *current = json!({});
    }
    if let Some(map) = current.as_object_mut() {
        map.insert(last.to_string(), value);
    }
}

fn remove_path(root: &mut Value, pointer: &str) {
    let Some((parent, last)) = pointer.rsplit_once('/') else {
        return;
    };
    let parent = if parent.is_empty() {
        Some(root)
    } else {
        root.pointer_mut(parent)
    };
    if let Some(map) = parent.and_then(Value::as_object_mut) {
        map.remove(last);
    }
}
