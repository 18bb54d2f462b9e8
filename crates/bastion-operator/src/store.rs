//! Object store boundary
//!
//! Every read and write the reconciliation core performs goes through
//! [`ObjectStore`]. [`KubeStore`] talks to the API server with a dynamic
//! client; [`MemoryStore`] keeps objects in process and simulates the parts
//! of server behaviour the core depends on (resource versions, generation
//! bumps, server-populated defaults and optimistic-lock conflicts).

use crate::crd::{
    BastionDatabase, BastionEnforcer, BastionGateway, BastionKubeEnforcer, BastionPlatform,
    BastionServer,
};
use crate::error::{OperatorError, Result};
use crate::quantity;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, Pod, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{Api, ApiResource, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Every object type the operator reads or writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Deployment,
    DaemonSet,
    Service,
    Secret,
    ConfigMap,
    PersistentVolumeClaim,
    ServiceAccount,
    Role,
    RoleBinding,
    Pod,
    Platform,
    Database,
    Gateway,
    Server,
    Enforcer,
    KubeEnforcer,
}

impl ObjectKind {
    /// Resource coordinates for the dynamic client
    pub fn api_resource(&self) -> ApiResource {
        match self {
            ObjectKind::Deployment => ApiResource::erase::<Deployment>(&()),
            ObjectKind::DaemonSet => ApiResource::erase::<DaemonSet>(&()),
            ObjectKind::Service => ApiResource::erase::<Service>(&()),
            ObjectKind::Secret => ApiResource::erase::<Secret>(&()),
            ObjectKind::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
            ObjectKind::PersistentVolumeClaim => ApiResource::erase::<PersistentVolumeClaim>(&()),
            ObjectKind::ServiceAccount => ApiResource::erase::<ServiceAccount>(&()),
            ObjectKind::Role => ApiResource::erase::<Role>(&()),
            ObjectKind::RoleBinding => ApiResource::erase::<RoleBinding>(&()),
            ObjectKind::Pod => ApiResource::erase::<Pod>(&()),
            ObjectKind::Platform => ApiResource::erase::<BastionPlatform>(&()),
            ObjectKind::Database => ApiResource::erase::<BastionDatabase>(&()),
            ObjectKind::Gateway => ApiResource::erase::<BastionGateway>(&()),
            ObjectKind::Server => ApiResource::erase::<BastionServer>(&()),
            ObjectKind::Enforcer => ApiResource::erase::<BastionEnforcer>(&()),
            ObjectKind::KubeEnforcer => ApiResource::erase::<BastionKubeEnforcer>(&()),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ObjectKind::Deployment => "Deployment",
            ObjectKind::DaemonSet => "DaemonSet",
            ObjectKind::Service => "Service",
            ObjectKind::Secret => "Secret",
            ObjectKind::ConfigMap => "ConfigMap",
            ObjectKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ObjectKind::ServiceAccount => "ServiceAccount",
            ObjectKind::Role => "Role",
            ObjectKind::RoleBinding => "RoleBinding",
            ObjectKind::Pod => "Pod",
            ObjectKind::Platform => "BastionPlatform",
            ObjectKind::Database => "BastionDatabase",
            ObjectKind::Gateway => "BastionGateway",
            ObjectKind::Server => "BastionServer",
            ObjectKind::Enforcer => "BastionEnforcer",
            ObjectKind::KubeEnforcer => "BastionKubeEnforcer",
        }
    }

    /// Bastion custom resources (as opposed to built-in Kubernetes kinds)
    pub fn is_custom(&self) -> bool {
        matches!(
            self,
            ObjectKind::Platform
                | ObjectKind::Database
                | ObjectKind::Gateway
                | ObjectKind::Server
                | ObjectKind::Enforcer
                | ObjectKind::KubeEnforcer
        )
    }

    /// Kinds whose content feeds workload checksums
    pub fn is_config_input(&self) -> bool {
        matches!(self, ObjectKind::Secret | ObjectKind::ConfigMap)
    }

    /// Kinds whose readiness is reported through replica counters
    pub fn is_workload(&self) -> bool {
        matches!(self, ObjectKind::Deployment | ObjectKind::DaemonSet)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind_name())
    }
}

/// Identity of a stored object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a dynamic object; the object must carry name and namespace
    pub fn of(kind: ObjectKind, object: &DynamicObject) -> Result<Self> {
        let name = object.metadata.name.clone().ok_or_else(|| {
            OperatorError::InvalidConfig(format!("{} missing metadata.name", kind))
        })?;
        let namespace = object.metadata.namespace.clone().ok_or_else(|| {
            OperatorError::InvalidConfig(format!("{} '{}' missing metadata.namespace", kind, name))
        })?;
        Ok(Self::new(kind, namespace, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Convert a typed object into the dynamic form the store works with
pub fn to_dynamic<K: Serialize>(object: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// Convert a dynamic object back into a typed one
pub fn typed<K: DeserializeOwned>(object: &DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// The external declarative API, reduced to what reconciliation needs
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch one object; `Ok(None)` when it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>>;

    /// List objects of one kind whose labels contain `selector`
    async fn list(
        &self,
        kind: ObjectKind,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>>;

    /// Create an object; fails with `Conflict` when it already exists
    async fn create(&self, kind: ObjectKind, object: &DynamicObject) -> Result<DynamicObject>;

    /// Replace an object, guarded by its `resourceVersion`
    async fn replace(&self, kind: ObjectKind, object: &DynamicObject) -> Result<DynamicObject>;

    /// Merge-patch the status subresource
    async fn patch_status(&self, key: &ObjectKey, status: &Value) -> Result<DynamicObject>;
}

/// Store backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: ObjectKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }
}

/// Map a write failure, surfacing 409 as a retryable conflict
fn write_error(kind: ObjectKind, name: &str, error: kube::Error) -> OperatorError {
    match error {
        kube::Error::Api(response) if response.code == 409 => OperatorError::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
            message: response.message,
        },
        other => OperatorError::from(other),
    }
}

fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        let api = self.api(key.kind, &key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn list(
        &self,
        kind: ObjectKind,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>> {
        let api = self.api(kind, namespace);
        let lp = ListParams::default().labels(&selector_string(selector));
        Ok(api.list(&lp).await?.items)
    }

    async fn create(&self, kind: ObjectKind, object: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(kind, object)?;
        debug!(object = %key, "Creating object");
        self.api(kind, &key.namespace)
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| write_error(kind, &key.name, e))
    }

    async fn replace(&self, kind: ObjectKind, object: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(kind, object)?;
        debug!(object = %key, "Replacing object");
        self.api(kind, &key.namespace)
            .replace(&key.name, &PostParams::default(), object)
            .await
            .map_err(|e| write_error(kind, &key.name, e))
    }

    async fn patch_status(&self, key: &ObjectKey, status: &Value) -> Result<DynamicObject> {
        debug!(object = %key, "Patching status");
        let patch = json!({ "status": status });
        self.api(key.kind, &key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| write_error(key.kind, &key.name, e))
    }
}

/// A write recorded by [`MemoryStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub verb: WriteVerb,
    pub key: ObjectKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteVerb {
    Create,
    Replace,
    PatchStatus,
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    revision: u64,
    pending_conflicts: u32,
    unreachable: bool,
    writes: Vec<WriteRecord>,
}

impl MemoryState {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable {
            return Err(OperatorError::StoreUnavailable(
                "memory store marked unreachable".to_string(),
            ));
        }
        Ok(())
    }
}

/// In-process object store
///
/// Simulates the API server closely enough to exercise the reconciliation
/// core: it assigns `uid`, `resourceVersion` and `creationTimestamp`, bumps
/// `metadata.generation` when `spec` changes, fills a few server-side
/// defaults, rejects stale `resourceVersion`s with `Conflict`, and records
/// every write.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object as if another actor had created it (not recorded as a write)
    pub fn insert(&self, kind: ObjectKind, object: DynamicObject) -> Result<ObjectKey> {
        let key = ObjectKey::of(kind, &object)?;
        let mut state = self.state.lock();
        let revision = state.next_revision();
        let stored = admit(kind, object, None, revision);
        state.objects.insert(key.clone(), stored);
        Ok(key)
    }

    /// Seed a typed object
    pub fn insert_typed<K: Serialize>(&self, kind: ObjectKind, object: &K) -> Result<ObjectKey> {
        self.insert(kind, to_dynamic(object)?)
    }

    /// Change an object out of band, like a user editing it
    pub fn mutate(&self, key: &ObjectKey, change: impl FnOnce(&mut DynamicObject)) -> bool {
        let mut state = self.state.lock();
        let Some(current) = state.objects.get(key).cloned() else {
            return false;
        };
        let mut next = current.clone();
        change(&mut next);
        let revision = state.next_revision();
        let stored = admit(key.kind, next, Some(&current), revision);
        state.objects.insert(key.clone(), stored);
        true
    }

    /// Overwrite the status of an object, like a controller reporting readiness
    pub fn set_status(&self, key: &ObjectKey, status: Value) -> bool {
        self.mutate(key, |object| {
            object.data["status"] = status;
        })
    }

    /// Report an object as fully rolled out at its current generation
    pub fn mark_ready(&self, key: &ObjectKey) -> bool {
        let Some(object) = self.peek(key) else {
            return false;
        };
        let generation = object.metadata.generation.unwrap_or(1);
        let status = match key.kind {
            ObjectKind::Deployment => {
                let replicas = object
                    .data
                    .pointer("/spec/replicas")
                    .and_then(Value::as_i64)
                    .unwrap_or(1);
                json!({
                    "observedGeneration": generation,
                    "replicas": replicas,
                    "readyReplicas": replicas,
                    "updatedReplicas": replicas,
                    "availableReplicas": replicas,
                })
            }
            ObjectKind::DaemonSet => json!({
                "observedGeneration": generation,
                "desiredNumberScheduled": 1,
                "currentNumberScheduled": 1,
                "numberReady": 1,
                "updatedNumberScheduled": 1,
                "numberMisscheduled": 0,
            }),
            kind if kind.is_custom() => json!({
                "state": "Running",
                "observedGeneration": generation,
            }),
            _ => return true,
        };
        self.set_status(key, status)
    }

    /// Mark every workload and child custom resource as ready
    pub fn mark_all_ready(&self) {
        let keys: Vec<ObjectKey> = self
            .state
            .lock()
            .objects
            .keys()
            .filter(|k| k.kind.is_workload() || k.kind.is_custom())
            .cloned()
            .collect();
        for key in keys {
            self.mark_ready(&key);
        }
    }

    /// Current stored copy of an object, bypassing reachability checks
    pub fn peek(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.state.lock().objects.get(key).cloned()
    }

    pub fn peek_typed<K: DeserializeOwned>(&self, key: &ObjectKey) -> Option<K> {
        self.peek(key).and_then(|o| typed(&o).ok())
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.state.lock().objects.contains_key(key)
    }

    /// Make the next `count` replace calls fail with `Conflict`
    pub fn inject_conflicts(&self, count: u32) {
        self.state.lock().pending_conflicts = count;
    }

    /// Make every call fail with `StoreUnavailable`
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Number of writes recorded so far
    pub fn writes(&self) -> usize {
        self.state.lock().writes.len()
    }

    pub fn write_log(&self) -> Vec<WriteRecord> {
        self.state.lock().writes.clone()
    }

    pub fn clear_write_log(&self) {
        self.state.lock().writes.clear();
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        let state = self.state.lock();
        state.check_reachable()?;
        Ok(state.objects.get(key).cloned())
    }

    async fn list(
        &self,
        kind: ObjectKind,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>> {
        let state = self.state.lock();
        state.check_reachable()?;
        Ok(state
            .objects
            .iter()
            .filter(|(key, _)| key.kind == kind && key.namespace == namespace)
            .filter(|(_, object)| {
                let labels = object.labels();
                selector.iter().all(|(k, v)| labels.get(k) == Some(v))
            })
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn create(&self, kind: ObjectKind, object: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(kind, object)?;
        let mut state = self.state.lock();
        state.check_reachable()?;
        if state.objects.contains_key(&key) {
            return Err(OperatorError::Conflict {
                kind: kind.to_string(),
                name: key.name,
                message: "already exists".to_string(),
            });
        }
        let revision = state.next_revision();
        let mut stored = admit(kind, object.clone(), None, revision);
        if kind.is_custom() {
            if let Some(data) = stored.data.as_object_mut() {
                data.remove("status");
            }
        }
        state.objects.insert(key.clone(), stored.clone());
        state.writes.push(WriteRecord {
            verb: WriteVerb::Create,
            key,
        });
        Ok(stored)
    }

    async fn replace(&self, kind: ObjectKind, object: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(kind, object)?;
        let mut state = self.state.lock();
        state.check_reachable()?;
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            return Err(OperatorError::Conflict {
                kind: kind.to_string(),
                name: key.name,
                message: "the object has been modified".to_string(),
            });
        }
        let Some(current) = state.objects.get(&key).cloned() else {
            return Err(OperatorError::NotFound {
                kind: kind.to_string(),
                name: key.name,
                namespace: key.namespace,
            });
        };
        if object.metadata.resource_version != current.metadata.resource_version {
            return Err(OperatorError::Conflict {
                kind: kind.to_string(),
                name: key.name,
                message: "stale resourceVersion".to_string(),
            });
        }
        let mut next = object.clone();
        // Status is only writable through the subresource
        match current.data.get("status") {
            Some(status) => next.data["status"] = status.clone(),
            None => {
                if let Some(data) = next.data.as_object_mut() {
                    data.remove("status");
                }
            }
        }
        let revision = state.next_revision();
        let stored = admit(kind, next, Some(&current), revision);
        state.objects.insert(key.clone(), stored.clone());
        state.writes.push(WriteRecord {
            verb: WriteVerb::Replace,
            key,
        });
        Ok(stored)
    }

    async fn patch_status(&self, key: &ObjectKey, status: &Value) -> Result<DynamicObject> {
        let mut state = self.state.lock();
        state.check_reachable()?;
        let revision = state.next_revision();
        let Some(stored) = state.objects.get_mut(key) else {
            return Err(OperatorError::NotFound {
                kind: key.kind.to_string(),
                name: key.name.clone(),
                namespace: key.namespace.clone(),
            });
        };
        if !stored.data.get("status").is_some_and(Value::is_object) {
            stored.data["status"] = json!({});
        }
        merge_patch(&mut stored.data["status"], status);
        stored.metadata.resource_version = Some(revision);
        let result = stored.clone();
        state.writes.push(WriteRecord {
            verb: WriteVerb::PatchStatus,
            key: key.clone(),
        });
        Ok(result)
    }
}

/// Stamp server-owned metadata and defaults onto an incoming object
fn admit(
    kind: ObjectKind,
    mut object: DynamicObject,
    current: Option<&DynamicObject>,
    revision: String,
) -> DynamicObject {
    apply_server_defaults(kind, &mut object.data);
    let meta = &mut object.metadata;
    meta.resource_version = Some(revision.clone());
    match current {
        None => {
            meta.uid = Some(format!("uid-{}", revision));
            meta.creation_timestamp = Some(
                k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Utc::now()),
            );
            meta.generation = Some(1);
        }
        Some(current) => {
            meta.uid = current.metadata.uid.clone();
            meta.creation_timestamp = current.metadata.creation_timestamp.clone();
            let generation = current.metadata.generation.unwrap_or(1);
            meta.generation = Some(if current.data.get("spec") != object.data.get("spec") {
                generation + 1
            } else {
                generation
            });
        }
    }
    object
}

fn set_default(target: &mut Value, field: &str, value: Value) {
    if let Some(map) = target.as_object_mut() {
        map.entry(field.to_string()).or_insert(value);
    }
}

fn default_pod_template(data: &mut Value) {
    let Some(pod_spec) = data.pointer_mut("/spec/template/spec") else {
        return;
    };
    set_default(pod_spec, "restartPolicy", json!("Always"));
    set_default(pod_spec, "dnsPolicy", json!("ClusterFirst"));
    set_default(pod_spec, "terminationGracePeriodSeconds", json!(30));
    if let Some(containers) = pod_spec.get_mut("containers").and_then(Value::as_array_mut) {
        for container in containers {
            set_default(
                container,
                "terminationMessagePath",
                json!("/dev/termination-log"),
            );
            set_default(container, "terminationMessagePolicy", json!("File"));
            set_default(container, "imagePullPolicy", json!("IfNotPresent"));
        }
    }
}

/// The subset of API-server defaulting that shows up in observed objects
fn apply_server_defaults(kind: ObjectKind, data: &mut Value) {
    quantity::canonicalize_resources(kind, data);
    match kind {
        ObjectKind::Deployment => {
            if let Some(spec) = data.get_mut("spec") {
                set_default(spec, "progressDeadlineSeconds", json!(600));
                set_default(spec, "revisionHistoryLimit", json!(10));
                set_default(
                    spec,
                    "strategy",
                    json!({
                        "type": "RollingUpdate",
                        "rollingUpdate": { "maxSurge": "25%", "maxUnavailable": "25%" }
                    }),
                );
            }
            default_pod_template(data);
        }
        ObjectKind::DaemonSet => {
            if let Some(spec) = data.get_mut("spec") {
                set_default(spec, "revisionHistoryLimit", json!(10));
                set_default(
                    spec,
                    "updateStrategy",
                    json!({
                        "type": "RollingUpdate",
                        "rollingUpdate": { "maxSurge": 0, "maxUnavailable": 1 }
                    }),
                );
            }
            default_pod_template(data);
        }
        ObjectKind::Service => {
            if let Some(spec) = data.get_mut("spec") {
                set_default(spec, "type", json!("ClusterIP"));
                set_default(spec, "sessionAffinity", json!("None"));
                set_default(spec, "clusterIP", json!("10.96.0.10"));
                if let Some(ports) = spec.get_mut("ports").and_then(Value::as_array_mut) {
                    for port in ports {
                        set_default(port, "protocol", json!("TCP"));
                        if let Some(number) = port.get("port").cloned() {
                            set_default(port, "targetPort", number);
                        }
                    }
                }
            }
        }
        ObjectKind::Secret => set_default(data, "type", json!("Opaque")),
        ObjectKind::PersistentVolumeClaim => {
            if let Some(spec) = data.get_mut("spec") {
                set_default(spec, "volumeMode", json!("Filesystem"));
            }
        }
        _ => {}
    }
}

/// JSON merge patch (RFC 7386)
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = json!({});
    }
    let Some(target_map) = target.as_object_mut() else {
        return;
    };
    for (key, value) in patch_map {
        if value.is_null() {
            target_map.remove(key);
        } else {
            merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn service(name: &str) -> DynamicObject {
        to_dynamic(&Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: Some(BTreeMap::from([(
                    "app.kubernetes.io/instance".to_string(),
                    "prod".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(k8s_openapi::api::core::v1::ServiceSpec {
                ports: Some(vec![k8s_openapi::api::core::v1::ServicePort {
                    port: 8080,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_object_key_display() {
        let key = ObjectKey::new(ObjectKind::Deployment, "default", "prod-server");
        assert_eq!(key.to_string(), "Deployment default/prod-server");
    }

    #[test]
    fn test_api_resource_for_custom_kinds() {
        let ar = ObjectKind::Enforcer.api_resource();
        assert_eq!(ar.group, "operator.bastion.dev");
        assert_eq!(ar.plural, "bastionenforcers");
        assert!(ObjectKind::Enforcer.is_custom());
        assert!(!ObjectKind::Secret.is_custom());
    }

    #[tokio::test]
    async fn test_create_assigns_server_fields() {
        let store = MemoryStore::new();
        let created = store
            .create(ObjectKind::Service, &service("prod-gateway"))
            .await
            .unwrap();

        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.resource_version.is_some());
        assert_eq!(created.data["spec"]["clusterIP"], "10.96.0.10");
        assert_eq!(created.data["spec"]["ports"][0]["protocol"], "TCP");
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_create_existing_conflicts() {
        let store = MemoryStore::new();
        store
            .create(ObjectKind::Service, &service("prod-gateway"))
            .await
            .unwrap();
        let err = store
            .create(ObjectKind::Service, &service("prod-gateway"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_replace_requires_current_resource_version() {
        let store = MemoryStore::new();
        let created = store
            .create(ObjectKind::Service, &service("prod-gateway"))
            .await
            .unwrap();

        let mut stale = created.clone();
        stale.metadata.resource_version = Some("0".to_string());
        assert!(store
            .replace(ObjectKind::Service, &stale)
            .await
            .unwrap_err()
            .is_conflict());

        let replaced = store
            .replace(ObjectKind::Service, &created)
            .await
            .unwrap();
        assert_ne!(
            replaced.metadata.resource_version,
            created.metadata.resource_version
        );
    }

    #[tokio::test]
    async fn test_generation_bumps_only_on_spec_change() {
        let store = MemoryStore::new();
        let created = store
            .create(ObjectKind::Service, &service("prod-gateway"))
            .await
            .unwrap();
        assert_eq!(created.metadata.generation, Some(1));

        let mut relabeled = created.clone();
        relabeled
            .labels_mut()
            .insert("team".to_string(), "security".to_string());
        let relabeled = store
            .replace(ObjectKind::Service, &relabeled)
            .await
            .unwrap();
        assert_eq!(relabeled.metadata.generation, Some(1));

        let mut respec = relabeled.clone();
        respec.data["spec"]["ports"][0]["port"] = json!(9090);
        let respec = store.replace(ObjectKind::Service, &respec).await.unwrap();
        assert_eq!(respec.metadata.generation, Some(2));
    }

    #[tokio::test]
    async fn test_injected_conflicts_are_consumed() {
        let store = MemoryStore::new();
        let created = store
            .create(ObjectKind::Service, &service("prod-gateway"))
            .await
            .unwrap();
        store.inject_conflicts(1);

        assert!(store
            .replace(ObjectKind::Service, &created)
            .await
            .unwrap_err()
            .is_conflict());
        assert!(store.replace(ObjectKind::Service, &created).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_filters_by_selector() {
        let store = MemoryStore::new();
        store.insert(ObjectKind::Service, service("a")).unwrap();
        let mut other = service("b");
        other.labels_mut().clear();
        store.insert(ObjectKind::Service, other).unwrap();

        let selector = BTreeMap::from([(
            "app.kubernetes.io/instance".to_string(),
            "prod".to_string(),
        )]);
        let found = store
            .list(ObjectKind::Service, "default", &selector)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name_any(), "a");
    }

    #[tokio::test]
    async fn test_patch_status_merges() {
        let store = MemoryStore::new();
        let key = store.insert(ObjectKind::Service, service("a")).unwrap();
        store
            .patch_status(&key, &json!({"state": "Pending", "nodes": []}))
            .await
            .unwrap();
        let patched = store
            .patch_status(&key, &json!({"state": "Running"}))
            .await
            .unwrap();
        assert_eq!(patched.data["status"]["state"], "Running");
        assert_eq!(patched.data["status"]["nodes"], json!([]));
        assert_eq!(store.writes(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_reads() {
        let store = MemoryStore::new();
        store.set_unreachable(true);
        let key = ObjectKey::new(ObjectKind::Secret, "default", "x");
        let err = store.get(&key).await.unwrap_err();
        assert!(matches!(err, OperatorError::StoreUnavailable(_)));
    }
}
