//! Custom Resource Definitions for the Bastion Kubernetes Operator
//!
//! Six namespaced kinds share one API group. `BastionPlatform` is the umbrella
//! resource; the other five describe one sub-system each and can also be
//! created on their own.

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements};
use kube::CustomResource;
use regex::Regex;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;
use validator::{Validate, ValidationError, ValidationErrors};

/// API group of every Bastion CRD
pub const API_GROUP: &str = "operator.bastion.dev";

/// Registry used when a spec leaves it unset
pub const DEFAULT_REGISTRY: &str = "registry.bastion.dev";

/// Platform release used as the default image tag
pub const DEFAULT_VERSION: &str = "2024.4";

/// Regex for validating Kubernetes resource quantities (e.g., "10Gi", "100Mi")
static QUANTITY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)?(Ki|Mi|Gi|Ti|Pi|Ei|k|M|G|T|P|E)?$").unwrap());

/// Regex for validating Kubernetes names (RFC 1123 subdomain)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Validate a Kubernetes resource quantity string
fn validate_quantity(value: &str) -> Result<(), ValidationError> {
    if QUANTITY_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_quantity")
            .with_message(format!("'{}' is not a valid Kubernetes quantity", value).into()))
    }
}

/// Validate one segment of an image reference (registry, repository or tag)
fn validate_image_part(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(()); // Empty is allowed (uses default)
    }
    if value.len() > 255 {
        return Err(ValidationError::new("image_too_long")
            .with_message("image reference exceeds 255 characters".into()));
    }
    if value.contains("..") || value.starts_with('/') || value.starts_with('-') {
        return Err(ValidationError::new("invalid_image")
            .with_message(format!("'{}' is not a valid image reference", value).into()));
    }
    Ok(())
}

/// Validate a Kubernetes name (RFC 1123 subdomain)
fn validate_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(()); // Empty is allowed for optional fields
    }
    if value.len() > 63 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 63 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// Validate image pull policy
fn validate_pull_policy(policy: &str) -> Result<(), ValidationError> {
    match policy {
        "Always" | "IfNotPresent" | "Never" => Ok(()),
        _ => Err(ValidationError::new("invalid_pull_policy")
            .with_message("imagePullPolicy must be Always, IfNotPresent, or Never".into())),
    }
}

/// Validate a Service type
fn validate_service_type(value: &str) -> Result<(), ValidationError> {
    match value {
        "ClusterIP" | "NodePort" | "LoadBalancer" => Ok(()),
        _ => Err(ValidationError::new("invalid_service_type")
            .with_message("serviceType must be ClusterIP, NodePort, or LoadBalancer".into())),
    }
}

/// Validate node selector map
fn validate_node_selector(selectors: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    if selectors.len() > 20 {
        return Err(ValidationError::new("too_many_selectors")
            .with_message("maximum 20 node selectors allowed".into()));
    }
    for (key, value) in selectors {
        if key.len() > 253 || value.len() > 63 {
            return Err(ValidationError::new("selector_too_long")
                .with_message("selector key max 253 chars, value max 63 chars".into()));
        }
    }
    Ok(())
}

/// Validate environment variables (POSIX names, no loader overrides)
fn validate_env_vars(vars: &[EnvVar]) -> Result<(), ValidationError> {
    const MAX_ENV_VARS: usize = 100;
    const FORBIDDEN: [&str; 4] = [
        "LD_PRELOAD",
        "LD_LIBRARY_PATH",
        "DYLD_INSERT_LIBRARIES",
        "DYLD_LIBRARY_PATH",
    ];
    if vars.len() > MAX_ENV_VARS {
        return Err(ValidationError::new("too_many_env_vars").with_message(
            format!("maximum {} environment variables allowed", MAX_ENV_VARS).into(),
        ));
    }
    for var in vars {
        if var.name.is_empty() || var.name.len() > 256 {
            return Err(ValidationError::new("invalid_env_name")
                .with_message("environment variable name must be 1-256 characters".into()));
        }
        if (FORBIDDEN.contains(&var.name.as_str()) || var.name.starts_with("LD_AUDIT"))
            && var.value.is_some()
        {
            return Err(ValidationError::new("forbidden_env_var").with_message(
                format!(
                    "environment variable '{}' is not allowed for security",
                    var.name
                )
                .into(),
            ));
        }
    }
    Ok(())
}

/// Validate free-form configuration entries
fn validate_config_map(entries: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    if entries.len() > 200 {
        return Err(ValidationError::new("too_many_entries")
            .with_message("maximum 200 configuration entries allowed".into()));
    }
    if entries.keys().any(|k| k.is_empty() || k.len() > 253) {
        return Err(ValidationError::new("invalid_key")
            .with_message("configuration keys must be 1-253 characters".into()));
    }
    Ok(())
}

/// Flatten `validator` output into one human-readable message.
///
/// Returns `None` when validation passed.
pub fn validation_message(result: Result<(), ValidationErrors>) -> Option<String> {
    let errors = result.err()?;
    let mut messages: Vec<String> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| match &e.message {
                Some(message) => format!("{}: {}", field, message),
                None => format!("{}: {}", field, e.code),
            })
        })
        .collect();
    // Nested structs report through `errors()`, not `field_errors()`
    if messages.is_empty() {
        messages.push(errors.to_string());
    }
    messages.sort();
    Some(messages.join("; "))
}

/// Schema for embedded Kubernetes objects whose shape the API server already knows
fn preserve_object_schema(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

/// Schema for lists of embedded Kubernetes objects
fn preserve_array_schema(generator: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Array.into()),
        ..Default::default()
    };
    schema.array().items = Some(preserve_object_schema(generator).into());
    Schema::Object(schema)
}

// ============================================================================
// Shared sub-specs
// ============================================================================

/// Container image coordinates; unset parts are filled by the driver
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Registry host (default: registry.bastion.dev)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_image_part"))]
    pub registry: Option<String>,

    /// Repository inside the registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_image_part"))]
    pub repository: Option<String>,

    /// Image tag (default: platform version)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_image_part"))]
    pub tag: Option<String>,

    /// Image pull policy (Always, IfNotPresent, Never)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_pull_policy"))]
    pub pull_policy: Option<String>,
}

impl ImageSpec {
    /// Fill every unset part, leaving user-supplied values untouched
    pub fn or_defaults(&self, registry: &str, repository: &str, tag: &str) -> Self {
        fn pick(value: &Option<String>, fallback: &str) -> Option<String> {
            match value {
                Some(v) if !v.is_empty() => Some(v.clone()),
                _ => Some(fallback.to_string()),
            }
        }
        Self {
            registry: pick(&self.registry, registry),
            repository: pick(&self.repository, repository),
            tag: pick(&self.tag, tag),
            pull_policy: pick(&self.pull_policy, "IfNotPresent"),
        }
    }

    /// Full image reference (`registry/repository:tag`)
    pub fn reference(&self) -> String {
        format!(
            "{}/{}:{}",
            self.registry.as_deref().unwrap_or(DEFAULT_REGISTRY),
            self.repository.as_deref().unwrap_or_default(),
            self.tag.as_deref().unwrap_or(DEFAULT_VERSION)
        )
    }
}

/// Settings shared by every workload the operator deploys
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    /// Replica count (ignored for DaemonSets)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0, max = 100, message = "replicas must be between 0 and 100"))]
    pub replicas: Option<i32>,

    /// Container image
    #[serde(default)]
    #[validate(nested)]
    pub image: ImageSpec,

    /// Resource requirements (CPU, memory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_object_schema")]
    pub resources: Option<ResourceRequirements>,

    /// Node selector for pod scheduling (max 20 selectors)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[validate(custom(function = "validate_node_selector"))]
    pub node_selector: BTreeMap<String, String>,

    /// Extra environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "preserve_array_schema")]
    #[validate(custom(function = "validate_env_vars"))]
    pub env: Vec<EnvVar>,

    /// Service account name (default: generated per component)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_k8s_name"))]
    pub service_account: Option<String>,

    /// Image pull secrets (max 10 secrets)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[validate(length(max = 10, message = "maximum 10 image pull secrets allowed"))]
    pub image_pull_secrets: Vec<String>,
}

impl WorkloadSpec {
    /// Apply the non-empty-if-unset defaults for one component
    pub fn with_defaults(&self, repository: &str, registry: &str, tag: &str) -> Self {
        let mut spec = self.clone();
        spec.replicas.get_or_insert(1);
        spec.image = self.image.or_defaults(registry, repository, tag);
        spec
    }
}

/// Reference to one key of a Secret
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    /// Secret name
    #[validate(length(min = 1, max = 63, message = "secret name must be 1-63 characters"))]
    #[validate(custom(function = "validate_k8s_name"))]
    pub name: String,

    /// Key inside the secret
    #[serde(default = "default_password_key")]
    pub key: String,
}

/// Connection to a PostgreSQL-compatible database
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConnectionSpec {
    /// Database host name
    #[validate(length(min = 1, max = 253, message = "host must be 1-253 characters"))]
    pub host: String,

    /// Database port
    #[serde(default = "default_db_port")]
    #[validate(range(min = 1, max = 65535, message = "port must be between 1 and 65535"))]
    pub port: i32,

    /// Database user
    #[serde(default = "default_db_user")]
    pub username: String,

    /// Secret holding the password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub password_secret: Option<SecretKeyRef>,
}

/// Persistent storage for a database instance
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStorageSpec {
    /// Volume size (e.g., "10Gi")
    #[serde(default = "default_storage_size")]
    #[validate(custom(function = "validate_quantity"))]
    pub size: String,

    /// Storage class name (empty uses default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_k8s_name"))]
    pub storage_class_name: Option<String>,
}

impl Default for DatabaseStorageSpec {
    fn default() -> Self {
        Self {
            size: default_storage_size(),
            storage_class_name: None,
        }
    }
}

// ============================================================================
// Status
// ============================================================================

/// Lifecycle of a Bastion resource, recomputed on every reconciliation pass
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash,
)]
pub enum LifecycleState {
    /// Newly observed, or no later state applies
    #[default]
    Pending,
    /// A predecessor tier (storage) is not ready yet
    WaitingOnDependency,
    /// Children are rolling out a change
    UpdateInProgress,
    /// Every requested child is ready
    Running,
    /// An enforcement change is held until `updateApproved` is true
    UpdatePendingApproval,
    /// Enforcement waits for the serving tier
    EnforcementWaiting,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Pending => "Pending",
            LifecycleState::WaitingOnDependency => "WaitingOnDependency",
            LifecycleState::UpdateInProgress => "UpdateInProgress",
            LifecycleState::Running => "Running",
            LifecycleState::UpdatePendingApproval => "UpdatePendingApproval",
            LifecycleState::EnforcementWaiting => "EnforcementWaiting",
        }
    }

    /// Parse the serialized form; unknown values map to `None`
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Pending" => Some(LifecycleState::Pending),
            "WaitingOnDependency" => Some(LifecycleState::WaitingOnDependency),
            "UpdateInProgress" => Some(LifecycleState::UpdateInProgress),
            "Running" => Some(LifecycleState::Running),
            "UpdatePendingApproval" => Some(LifecycleState::UpdatePendingApproval),
            "EnforcementWaiting" => Some(LifecycleState::EnforcementWaiting),
            _ => None,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status shared by every Bastion kind
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BastionStatus {
    /// Current lifecycle state
    #[serde(default)]
    pub state: LifecycleState,

    /// Generation of the spec this status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Instances backing the resource (`pod@node`)
    #[serde(default)]
    pub nodes: Vec<String>,

    /// Conditions describing the resource
    #[serde(default)]
    pub conditions: Vec<StatusCondition>,

    /// Human-readable summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the status was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

/// Condition describing an aspect of resource state
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, Unknown)
    pub status: String,

    /// Reason for the condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last transition time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

// ============================================================================
// BastionDatabase
// ============================================================================

/// PostgreSQL instance(s) backing the platform (storage tier)
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "operator.bastion.dev",
    version = "v1alpha1",
    kind = "BastionDatabase",
    plural = "bastiondatabases",
    shortname = "bdb",
    namespaced,
    status = "BastionStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BastionDatabaseSpec {
    /// Workload settings
    #[serde(default)]
    #[validate(nested)]
    pub deploy: WorkloadSpec,

    /// Persistent volume settings
    #[serde(default)]
    #[validate(nested)]
    pub storage: DatabaseStorageSpec,

    /// Existing password secret; generated when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub password_secret: Option<SecretKeyRef>,

    /// Run a second instance for audit data
    #[serde(default)]
    pub split_audit: bool,
}

// ============================================================================
// BastionGateway
// ============================================================================

/// Gateway between enforcers and the server (serving tier)
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "operator.bastion.dev",
    version = "v1alpha1",
    kind = "BastionGateway",
    plural = "bastiongateways",
    shortname = "bgw",
    namespaced,
    status = "BastionStatus",
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.deploy.replicas"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BastionGatewaySpec {
    /// Workload settings
    #[serde(default)]
    #[validate(nested)]
    pub deploy: WorkloadSpec,

    /// Main database connection
    #[validate(nested)]
    pub database: DatabaseConnectionSpec,

    /// Audit database connection (required when `splitDb` is set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub audit_database: Option<DatabaseConnectionSpec>,

    /// Keep audit data in a separate database
    #[serde(default)]
    pub split_db: bool,

    /// Address of the server's gRPC endpoint (default: `<name>-server:8443`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_address: Option<String>,
}

// ============================================================================
// BastionServer
// ============================================================================

/// Console and API server (serving tier)
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "operator.bastion.dev",
    version = "v1alpha1",
    kind = "BastionServer",
    plural = "bastionservers",
    shortname = "bsv",
    namespaced,
    status = "BastionStatus",
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.deploy.replicas"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BastionServerSpec {
    /// Workload settings
    #[serde(default)]
    #[validate(nested)]
    pub deploy: WorkloadSpec,

    /// Main database connection
    #[validate(nested)]
    pub database: DatabaseConnectionSpec,

    /// Audit database connection (required when `splitDb` is set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub audit_database: Option<DatabaseConnectionSpec>,

    /// Keep audit data in a separate database
    #[serde(default)]
    pub split_db: bool,

    /// Secret with the initial administrator password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub admin_password_secret: Option<SecretKeyRef>,

    /// Secret with the license token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub license_secret: Option<SecretKeyRef>,

    /// Service type for the console (default: ClusterIP)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_service_type"))]
    pub service_type: Option<String>,

    /// Extra server configuration rendered into `config.yaml`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[validate(custom(function = "validate_config_map"))]
    pub config: BTreeMap<String, String>,
}

// ============================================================================
// BastionEnforcer
// ============================================================================

/// Node-level enforcer DaemonSet (enforcement tier)
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "operator.bastion.dev",
    version = "v1alpha1",
    kind = "BastionEnforcer",
    plural = "bastionenforcers",
    shortname = "benf",
    namespaced,
    status = "BastionStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Approved", "type":"boolean", "jsonPath":".spec.updateApproved"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BastionEnforcerSpec {
    /// Workload settings
    #[serde(default)]
    #[validate(nested)]
    pub deploy: WorkloadSpec,

    /// Gateway address enforcers connect to
    #[validate(length(min = 1, max = 253, message = "gatewayAddress must be 1-253 characters"))]
    pub gateway_address: String,

    /// Enforcer group token (stored in an operator-owned secret)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Existing secret holding the token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub token_secret: Option<SecretKeyRef>,

    /// Update gate: unset or true applies changes, false holds them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_approved: Option<bool>,
}

// ============================================================================
// BastionKubeEnforcer
// ============================================================================

/// Cluster-level admission enforcer (enforcement tier)
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "operator.bastion.dev",
    version = "v1alpha1",
    kind = "BastionKubeEnforcer",
    plural = "bastionkubeenforcers",
    shortname = "bke",
    namespaced,
    status = "BastionStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Approved", "type":"boolean", "jsonPath":".spec.updateApproved"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BastionKubeEnforcerSpec {
    /// Workload settings
    #[serde(default)]
    #[validate(nested)]
    pub deploy: WorkloadSpec,

    /// Gateway address the kube-enforcer connects to
    #[validate(length(min = 1, max = 253, message = "gatewayAddress must be 1-253 characters"))]
    pub gateway_address: String,

    /// Enforcer group token (stored in an operator-owned secret)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Existing secret holding the token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub token_secret: Option<SecretKeyRef>,

    /// Extra kube-enforcer settings
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[validate(custom(function = "validate_config_map"))]
    pub config: BTreeMap<String, String>,

    /// Update gate: unset or true applies changes, false holds them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_approved: Option<bool>,
}

// ============================================================================
// BastionPlatform
// ============================================================================

/// The whole platform: database, server, gateway and enforcers
///
/// # Example
///
/// ```yaml
/// apiVersion: operator.bastion.dev/v1alpha1
/// kind: BastionPlatform
/// metadata:
///   name: prod
/// spec:
///   common:
///     version: "2024.4"
///   database: {}
///   gateway:
///     replicas: 2
///   server: {}
///   enforcer:
///     token: "enforcer-group-token"
///   enforcement:
///     updateApproved: false
/// ```
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "operator.bastion.dev",
    version = "v1alpha1",
    kind = "BastionPlatform",
    plural = "bastionplatforms",
    shortname = "bpl",
    namespaced,
    status = "BastionStatus",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.common.version"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BastionPlatformSpec {
    /// Settings inherited by every component
    #[serde(default)]
    #[validate(nested)]
    pub common: PlatformCommonSpec,

    /// In-cluster database (defaulted when serving components need one)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub database: Option<PlatformDatabaseSpec>,

    /// External database used instead of the in-cluster one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub external_db: Option<DatabaseConnectionSpec>,

    /// External audit database (required with `externalDb` and `common.splitDb`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub audit_db: Option<DatabaseConnectionSpec>,

    /// Gateway workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub gateway: Option<WorkloadSpec>,

    /// Server workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub server: Option<PlatformServerSpec>,

    /// Node enforcer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub enforcer: Option<PlatformEnforcerSpec>,

    /// Kube enforcer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub kube_enforcer: Option<PlatformKubeEnforcerSpec>,

    /// Human approval gate for enforcement-tier changes
    #[serde(default)]
    pub enforcement: EnforcementApprovalSpec,
}

/// Settings inherited by every platform component
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlatformCommonSpec {
    /// Registry for every component image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_image_part"))]
    pub registry: Option<String>,

    /// Platform release, used as the default image tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_image_part"))]
    pub version: Option<String>,

    /// Image pull secrets for every component
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[validate(length(max = 10, message = "maximum 10 image pull secrets allowed"))]
    pub image_pull_secrets: Vec<String>,

    /// Keep audit data in a separate database
    #[serde(default)]
    pub split_db: bool,

    /// Existing database password secret; generated when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub db_password_secret: Option<SecretKeyRef>,
}

/// In-cluster database section of a platform
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlatformDatabaseSpec {
    /// Workload settings
    #[serde(default)]
    #[validate(nested)]
    pub deploy: WorkloadSpec,

    /// Persistent volume settings
    #[serde(default)]
    #[validate(nested)]
    pub storage: DatabaseStorageSpec,
}

/// Server section of a platform
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlatformServerSpec {
    /// Workload settings
    #[serde(default)]
    #[validate(nested)]
    pub deploy: WorkloadSpec,

    /// Secret with the initial administrator password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub admin_password_secret: Option<SecretKeyRef>,

    /// Secret with the license token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub license_secret: Option<SecretKeyRef>,

    /// Service type for the console
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_service_type"))]
    pub service_type: Option<String>,

    /// Extra server configuration
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[validate(custom(function = "validate_config_map"))]
    pub config: BTreeMap<String, String>,
}

/// Enforcer section of a platform
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlatformEnforcerSpec {
    /// Workload settings
    #[serde(default)]
    #[validate(nested)]
    pub deploy: WorkloadSpec,

    /// Enforcer group token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Existing secret holding the token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub token_secret: Option<SecretKeyRef>,
}

/// Kube-enforcer section of a platform
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlatformKubeEnforcerSpec {
    /// Workload settings
    #[serde(default)]
    #[validate(nested)]
    pub deploy: WorkloadSpec,

    /// Enforcer group token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Existing secret holding the token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub token_secret: Option<SecretKeyRef>,

    /// Extra kube-enforcer settings
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[validate(custom(function = "validate_config_map"))]
    pub config: BTreeMap<String, String>,
}

/// Approval gate for enforcement-tier updates
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnforcementApprovalSpec {
    /// Unset or true applies changes, false holds them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_approved: Option<bool>,
}

// Default value functions
fn default_password_key() -> String {
    "password".to_string()
}

fn default_db_port() -> i32 {
    5432
}

fn default_db_user() -> String {
    "postgres".to_string()
}

fn default_storage_size() -> String {
    "10Gi".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_image_defaults_fill_only_unset_parts() {
        let image = ImageSpec {
            tag: Some("2024.2".to_string()),
            ..Default::default()
        };
        let filled = image.or_defaults(DEFAULT_REGISTRY, "server", DEFAULT_VERSION);

        assert_eq!(filled.reference(), "registry.bastion.dev/server:2024.2");
        assert_eq!(filled.pull_policy.as_deref(), Some("IfNotPresent"));
    }

    #[test]
    fn test_empty_image_parts_are_defaulted() {
        let image = ImageSpec {
            registry: Some(String::new()),
            ..Default::default()
        };
        let filled = image.or_defaults("mirror.local", "gateway", "1.0");
        assert_eq!(filled.reference(), "mirror.local/gateway:1.0");
    }

    #[test]
    fn test_workload_defaults_replicas() {
        let spec = WorkloadSpec::default().with_defaults("gateway", DEFAULT_REGISTRY, "1.0");
        assert_eq!(spec.replicas, Some(1));

        let spec = WorkloadSpec {
            replicas: Some(3),
            ..Default::default()
        }
        .with_defaults("gateway", DEFAULT_REGISTRY, "1.0");
        assert_eq!(spec.replicas, Some(3));
    }

    #[test]
    fn test_lifecycle_state_round_trips_as_string() {
        let json = serde_json::to_value(LifecycleState::UpdatePendingApproval).unwrap();
        assert_eq!(json, serde_json::json!("UpdatePendingApproval"));
        assert_eq!(
            LifecycleState::parse("EnforcementWaiting"),
            Some(LifecycleState::EnforcementWaiting)
        );
        assert_eq!(LifecycleState::parse("Bogus"), None);
    }

    #[test]
    fn test_validation_rejects_bad_quantity() {
        let spec = BastionDatabaseSpec {
            storage: DatabaseStorageSpec {
                size: "lots".to_string(),
                storage_class_name: None,
            },
            ..Default::default()
        };
        let message = validation_message(spec.validate());
        assert!(message.is_some());
    }

    #[test]
    fn test_validation_rejects_forbidden_env() {
        let spec = WorkloadSpec {
            env: vec![EnvVar {
                name: "LD_PRELOAD".to_string(),
                value: Some("/tmp/x.so".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(validation_message(spec.validate()).is_some());
    }

    #[test]
    fn test_validation_accepts_defaults() {
        let spec = BastionGatewaySpec {
            database: DatabaseConnectionSpec {
                host: "db".to_string(),
                port: 5432,
                username: "postgres".to_string(),
                password_secret: None,
            },
            ..Default::default()
        };
        assert_eq!(validation_message(spec.validate()), None);
    }

    #[test]
    fn test_validation_rejects_bad_service_type() {
        let spec = PlatformServerSpec {
            service_type: Some("Ingress".to_string()),
            ..Default::default()
        };
        assert!(validation_message(spec.validate()).is_some());
    }

    #[test]
    fn test_crds_generate() {
        let crd = BastionPlatform::crd();
        assert_eq!(crd.spec.group, API_GROUP);
        assert_eq!(crd.spec.names.kind, "BastionPlatform");
        assert_eq!(BastionEnforcer::crd().spec.names.plural, "bastionenforcers");
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = BastionStatus {
            state: LifecycleState::Running,
            observed_generation: Some(2),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "Running");
        assert_eq!(json["observedGeneration"], 2);
    }
}
