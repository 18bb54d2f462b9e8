//! Kubernetes Resource Builders
//!
//! Shared manifest templating for every Bastion component: the fixed label
//! set, owner references, and Deployment/DaemonSet/Service/Secret/... shapes
//! with secure defaults.

use crate::crd::{DatabaseStorageSpec, SecretKeyRef, WorkloadSpec};
use crate::error::{OperatorError, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, Container, ContainerPort, EnvVar, EnvVarSource, LocalObjectReference,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSecurityContext, PodSpec,
    PodTemplateSpec, SeccompProfile, Secret, SecretKeySelector, SecurityContext, Service,
    ServiceAccount, ServicePort, ServiceSpec, VolumeResourceRequirements,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::Resource;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::BTreeMap;

/// Value of `app.kubernetes.io/managed-by` on every child
pub const MANAGER: &str = "bastion-operator";

/// Value of `app.kubernetes.io/name` on every child
pub const APP_NAME: &str = "bastion";

/// UID the non-privileged Bastion images run as
const BASTION_UID: i64 = 1000;

/// Builder for the children of one parent resource and component
#[derive(Debug, Clone)]
pub struct ResourceBuilder {
    instance: String,
    namespace: String,
    component: &'static str,
    owner: OwnerReference,
}

impl ResourceBuilder {
    /// Create a builder for `parent`'s `component` children
    pub fn new<K>(parent: &K, component: &'static str) -> Result<Self>
    where
        K: Resource<DynamicType = ()>,
    {
        let meta = parent.meta();
        let instance = meta
            .name
            .clone()
            .ok_or_else(|| OperatorError::InvalidConfig("resource name is required".to_string()))?;
        let namespace = meta
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let owner = OwnerReference {
            api_version: K::api_version(&()).to_string(),
            kind: K::kind(&()).to_string(),
            name: instance.clone(),
            uid: meta.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        };
        Ok(Self {
            instance,
            namespace,
            component,
            owner,
        })
    }

    /// Same parent, another component
    pub fn with_component(&self, component: &'static str) -> Self {
        Self {
            component,
            ..self.clone()
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Owner reference for managed resources
    pub fn owner_reference(&self) -> OwnerReference {
        self.owner.clone()
    }

    /// Base name of this component's children (`<instance>-<component>`)
    pub fn resource_name(&self) -> String {
        format!("{}-{}", self.instance, self.component)
    }

    /// Full label set for children
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.selector_labels();
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            MANAGER.to_string(),
        );
        labels
    }

    /// Labels used in selectors (stable across upgrades)
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app.kubernetes.io/name".to_string(), APP_NAME.to_string()),
            (
                "app.kubernetes.io/instance".to_string(),
                self.instance.clone(),
            ),
            (
                "app.kubernetes.io/component".to_string(),
                self.component.to_string(),
            ),
        ])
    }

    /// Standard metadata for a child called `name`
    pub fn metadata(&self, name: impl Into<String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.into()),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels()),
            owner_references: Some(vec![self.owner_reference()]),
            ..Default::default()
        }
    }

    /// Service account for this component's pods
    pub fn build_service_account(&self, name: &str, workload: &WorkloadSpec) -> ServiceAccount {
        ServiceAccount {
            metadata: self.metadata(name),
            image_pull_secrets: local_references(&workload.image_pull_secrets),
            ..Default::default()
        }
    }

    /// ClusterIP (or `service_type`) service selecting this component's pods
    pub fn build_service(
        &self,
        name: &str,
        ports: &[(&str, i32)],
        service_type: Option<&str>,
    ) -> Service {
        Service {
            metadata: self.metadata(name),
            spec: Some(ServiceSpec {
                type_: Some(service_type.unwrap_or("ClusterIP").to_string()),
                selector: Some(self.selector_labels()),
                ports: Some(
                    ports
                        .iter()
                        .map(|(port_name, port)| ServicePort {
                            name: Some(port_name.to_string()),
                            port: *port,
                            target_port: Some(IntOrString::Int(*port)),
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Opaque secret with binary payloads
    pub fn build_secret(&self, name: &str, data: BTreeMap<String, Vec<u8>>) -> Secret {
        Secret {
            metadata: self.metadata(name),
            type_: Some("Opaque".to_string()),
            data: Some(
                data.into_iter()
                    .map(|(k, v)| (k, ByteString(v)))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    pub fn build_config_map(&self, name: &str, data: BTreeMap<String, String>) -> ConfigMap {
        ConfigMap {
            metadata: self.metadata(name),
            data: Some(data),
            ..Default::default()
        }
    }

    /// Persistent volume claim for database storage
    pub fn build_pvc(&self, name: &str, storage: &DatabaseStorageSpec) -> PersistentVolumeClaim {
        let mut requests = BTreeMap::new();
        requests.insert("storage".to_string(), Quantity(storage.size.clone()));

        PersistentVolumeClaim {
            metadata: self.metadata(name),
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: storage.storage_class_name.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn build_role(&self, name: &str, rules: Vec<PolicyRule>) -> Role {
        Role {
            metadata: self.metadata(name),
            rules: Some(rules),
        }
    }

    pub fn build_role_binding(&self, name: &str, role: &str, service_account: &str) -> RoleBinding {
        RoleBinding {
            metadata: self.metadata(name),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: role.to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: service_account.to_string(),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            }]),
        }
    }

    /// Pod template shared by Deployments and DaemonSets
    fn pod_template(&self, pod: PodSpec) -> PodTemplateSpec {
        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(self.selector_labels()),
                ..Default::default()
            }),
            spec: Some(pod),
        }
    }

    pub fn build_deployment(&self, name: &str, replicas: i32, pod: PodSpec) -> Deployment {
        Deployment {
            metadata: self.metadata(name),
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                selector: LabelSelector {
                    match_labels: Some(self.selector_labels()),
                    ..Default::default()
                },
                template: self.pod_template(pod),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn build_daemon_set(&self, name: &str, pod: PodSpec) -> DaemonSet {
        DaemonSet {
            metadata: self.metadata(name),
            spec: Some(DaemonSetSpec {
                selector: LabelSelector {
                    match_labels: Some(self.selector_labels()),
                    ..Default::default()
                },
                template: self.pod_template(pod),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Pod spec with secure defaults, scheduling and pull secrets from `workload`
    pub fn build_pod_spec(
        &self,
        workload: &WorkloadSpec,
        containers: Vec<Container>,
        service_account: &str,
    ) -> PodSpec {
        PodSpec {
            containers,
            service_account_name: Some(service_account.to_string()),
            security_context: Some(PodSecurityContext {
                run_as_non_root: Some(true),
                run_as_user: Some(BASTION_UID),
                run_as_group: Some(BASTION_UID),
                fs_group: Some(BASTION_UID),
                seccomp_profile: Some(SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            node_selector: if workload.node_selector.is_empty() {
                None
            } else {
                Some(workload.node_selector.clone())
            },
            image_pull_secrets: local_references(&workload.image_pull_secrets),
            ..Default::default()
        }
    }

    /// Main container for this component
    pub fn build_container(
        &self,
        workload: &WorkloadSpec,
        ports: &[(&str, i32)],
        mut env: Vec<EnvVar>,
    ) -> Container {
        env.extend(workload.env.iter().cloned());
        Container {
            name: self.component.to_string(),
            image: Some(workload.image.reference()),
            image_pull_policy: workload.image.pull_policy.clone(),
            env: if env.is_empty() { None } else { Some(env) },
            ports: if ports.is_empty() {
                None
            } else {
                Some(
                    ports
                        .iter()
                        .map(|(name, port)| ContainerPort {
                            name: Some(name.to_string()),
                            container_port: *port,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        })
                        .collect(),
                )
            },
            resources: workload.resources.clone(),
            security_context: Some(restricted_security_context()),
            ..Default::default()
        }
    }
}

/// Container security context for non-privileged components
pub fn restricted_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        run_as_non_root: Some(true),
        run_as_user: Some(BASTION_UID),
        run_as_group: Some(BASTION_UID),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn local_references(names: &[String]) -> Option<Vec<LocalObjectReference>> {
    if names.is_empty() {
        None
    } else {
        Some(
            names
                .iter()
                .map(|name| LocalObjectReference { name: name.clone() })
                .collect(),
        )
    }
}

/// Plain environment variable
pub fn env_value(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Environment variable sourced from a secret key
pub fn env_secret(name: &str, secret: &SecretKeyRef) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.name.clone(),
                key: secret.key.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Random alphanumeric credential
pub fn generate_password(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}
