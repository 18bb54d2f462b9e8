//! Content checksums over workload inputs
//!
//! Workloads carry a hash of the Secrets and ConfigMaps they read as a pod
//! template annotation. When any input byte changes the annotation changes,
//! the comparator sees a template diff and the workload rolls.

use crate::error::Result;
use crate::store::{typed, ObjectKind};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::DynamicObject;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Pod template annotation carrying the input checksum
pub const INPUTS_CHECKSUM_ANNOTATION: &str = "operator.bastion.dev/inputs-checksum";

/// Accumulates payload digests into one token.
///
/// The token does not depend on the order payloads were added in: digests
/// are sorted before the final hash is taken.
#[derive(Debug, Clone, Default)]
pub struct ChecksumAccumulator {
    digests: Vec<[u8; 32]>,
}

impl ChecksumAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an anonymous payload
    pub fn add(&mut self, payload: &[u8]) {
        self.digests.push(Sha256::digest(payload).into());
    }

    /// Add a payload bound to a label, so moving bytes between keys changes the token
    pub fn add_named(&mut self, label: &str, payload: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(label.as_bytes());
        hasher.update([0u8]);
        hasher.update(payload);
        self.digests.push(hasher.finalize().into());
    }

    /// Add every key of a Secret
    pub fn add_secret(&mut self, secret: &Secret) {
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        for (key, value) in secret.data.iter().flatten() {
            self.add_named(&format!("secret/{}/{}", name, key), &value.0);
        }
        for (key, value) in secret.string_data.iter().flatten() {
            self.add_named(&format!("secret/{}/{}", name, key), value.as_bytes());
        }
    }

    /// Add every key of a ConfigMap
    pub fn add_config_map(&mut self, config_map: &ConfigMap) {
        let name = config_map.metadata.name.as_deref().unwrap_or_default();
        for (key, value) in config_map.data.iter().flatten() {
            self.add_named(&format!("configmap/{}/{}", name, key), value.as_bytes());
        }
        for (key, value) in config_map.binary_data.iter().flatten() {
            self.add_named(&format!("configmap/{}/{}", name, key), &value.0);
        }
    }

    /// Add a stored object of any kind
    pub fn add_object(&mut self, kind: ObjectKind, object: &DynamicObject) -> Result<()> {
        match kind {
            ObjectKind::Secret => self.add_secret(&typed(object)?),
            ObjectKind::ConfigMap => self.add_config_map(&typed(object)?),
            other => {
                let payload = serde_json::to_vec(&object.data)?;
                self.add_named(other.kind_name(), &payload);
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    /// Hex-encoded SHA-256 over the sorted payload digests
    pub fn token(&self) -> String {
        let mut sorted = self.digests.clone();
        sorted.sort_unstable();
        let mut hasher = Sha256::new();
        for digest in &sorted {
            hasher.update(digest);
        }
        hex::encode(hasher.finalize())
    }
}

/// Write `token` into the pod template annotations of a workload.
///
/// Returns `false` when the object has no pod template.
pub fn stamp_pod_template(object: &mut DynamicObject, token: &str) -> bool {
    let Some(template) = object.data.pointer_mut("/spec/template") else {
        return false;
    };
    let Some(template) = template.as_object_mut() else {
        return false;
    };
    let metadata = template
        .entry("metadata".to_string())
        .or_insert_with(|| json!({}));
    if !metadata.is_object() {
        *metadata = json!({});
    }
    let annotations = &mut metadata["annotations"];
    if !annotations.is_object() {
        *annotations = json!({});
    }
    annotations[INPUTS_CHECKSUM_ANNOTATION] = Value::String(token.to_string());
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn secret(password: &[u8]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("prod-database-password".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "password".to_string(),
                ByteString(password.to_vec()),
            )])),
            ..Default::default()
        }
    }

    #[test]
    fn test_token_is_deterministic() {
        let mut a = ChecksumAccumulator::new();
        a.add_secret(&secret(b"s3cret"));
        let mut b = ChecksumAccumulator::new();
        b.add_secret(&secret(b"s3cret"));
        assert_eq!(a.token(), b.token());
        assert_eq!(a.token().len(), 64);
    }

    #[test]
    fn test_token_is_order_independent() {
        let mut a = ChecksumAccumulator::new();
        a.add(b"first");
        a.add(b"second");
        let mut b = ChecksumAccumulator::new();
        b.add(b"second");
        b.add(b"first");
        assert_eq!(a.token(), b.token());
    }

    #[test]
    fn test_any_byte_change_changes_token() {
        let mut a = ChecksumAccumulator::new();
        a.add_secret(&secret(b"s3cret"));
        let mut b = ChecksumAccumulator::new();
        b.add_secret(&secret(b"s3creT"));
        assert_ne!(a.token(), b.token());
    }

    #[test]
    fn test_moving_value_between_keys_changes_token() {
        let mut a = ChecksumAccumulator::new();
        a.add_named("secret/x/a", b"value");
        let mut b = ChecksumAccumulator::new();
        b.add_named("secret/x/b", b"value");
        assert_ne!(a.token(), b.token());
    }

    #[test]
    fn test_config_map_keys_are_hashed() {
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some("prod-server-config".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "config.yaml".to_string(),
                "port: 8443\n".to_string(),
            )])),
            ..Default::default()
        };
        let mut acc = ChecksumAccumulator::new();
        assert!(acc.is_empty());
        acc.add_config_map(&config_map);
        assert!(!acc.is_empty());
    }

    #[test]
    fn test_stamp_pod_template() {
        let mut object: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "prod-server"},
            "spec": {"template": {"spec": {"containers": []}}}
        }))
        .unwrap();
        assert!(stamp_pod_template(&mut object, "abc"));
        assert_eq!(
            object.data["spec"]["template"]["metadata"]["annotations"][INPUTS_CHECKSUM_ANNOTATION],
            "abc"
        );

        let mut service: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "prod-server"},
            "spec": {}
        }))
        .unwrap();
        assert!(!stamp_pod_template(&mut service, "abc"));
    }
}
