//! BastionDatabase: PostgreSQL backing the platform (storage tier)

use super::{secret_input, service_account_name, DATABASE_PORT};
use crate::crd::{
    validation_message, BastionDatabase, BastionDatabaseSpec, BastionStatus, SecretKeyRef,
    DEFAULT_REGISTRY, DEFAULT_VERSION,
};
use crate::driver::{DesiredChild, ManagedKind};
use crate::error::Result;
use crate::resources::{env_secret, env_value, generate_password, ResourceBuilder};
use crate::sequencer::Tier;
use crate::store::ObjectKind;
use k8s_openapi::api::apps::v1::DeploymentStrategy;
use k8s_openapi::api::core::v1::{PersistentVolumeClaimVolumeSource, Volume, VolumeMount};
use kube::ResourceExt;
use std::collections::BTreeMap;
use validator::Validate;

const REPOSITORY: &str = "database";
const AUDIT_COMPONENT: &str = "audit-database";
const DATA_PATH: &str = "/var/lib/postgresql/data";
const PASSWORD_LENGTH: usize = 32;

/// Key of the generated password secret
pub const PASSWORD_KEY: &str = "password";

impl BastionDatabase {
    /// Secret holding the superuser password, user-supplied or generated
    pub fn password_secret(&self) -> SecretKeyRef {
        self.spec
            .password_secret
            .clone()
            .unwrap_or_else(|| SecretKeyRef {
                name: format!("{}-database-password", self.name_any()),
                key: PASSWORD_KEY.to_string(),
            })
    }
}

impl ManagedKind for BastionDatabase {
    const COMPONENT: &'static str = "database";
    const KIND: ObjectKind = ObjectKind::Database;
    const OWNED: &'static [ObjectKind] = &[
        ObjectKind::Secret,
        ObjectKind::ServiceAccount,
        ObjectKind::PersistentVolumeClaim,
        ObjectKind::Service,
        ObjectKind::Deployment,
    ];

    fn with_defaults(&self) -> Self {
        let mut defaulted = self.clone();
        defaulted.spec.deploy =
            self.spec
                .deploy
                .with_defaults(REPOSITORY, DEFAULT_REGISTRY, DEFAULT_VERSION);
        defaulted
    }

    fn spec_errors(&self) -> Option<String> {
        validation_message(self.spec.validate())
    }

    fn build_children(&self) -> Result<Vec<DesiredChild>> {
        let builder = ResourceBuilder::new(self, Self::COMPONENT)?;
        let password = self.password_secret();
        let service_account = service_account_name(&builder, &self.spec.deploy);
        let mut children = Vec::new();

        if self.spec.password_secret.is_none() {
            let secret = builder.build_secret(
                &password.name,
                BTreeMap::from([(
                    PASSWORD_KEY.to_string(),
                    generate_password(PASSWORD_LENGTH).into_bytes(),
                )]),
            );
            children
                .push(DesiredChild::new(ObjectKind::Secret, Tier::Storage, &secret)?.create_only());
        }
        if self.spec.deploy.service_account.is_none() {
            let account = builder.build_service_account(&service_account, &self.spec.deploy);
            children.push(DesiredChild::new(
                ObjectKind::ServiceAccount,
                Tier::Storage,
                &account,
            )?);
        }

        children.extend(instance(&builder, &self.spec, &password, &service_account)?);
        if self.spec.split_audit {
            children.extend(instance(
                &builder.with_component(AUDIT_COMPONENT),
                &self.spec,
                &password,
                &service_account,
            )?);
        }
        Ok(children)
    }

    fn status(&self) -> Option<&BastionStatus> {
        self.status.as_ref()
    }
}

/// Volume, service and deployment of one database instance
fn instance(
    builder: &ResourceBuilder,
    spec: &BastionDatabaseSpec,
    password: &SecretKeyRef,
    service_account: &str,
) -> Result<Vec<DesiredChild>> {
    let name = builder.resource_name();
    let ports = [("postgres", DATABASE_PORT)];

    let mut container = builder.build_container(
        &spec.deploy,
        &ports,
        vec![
            env_value("POSTGRES_USER", "postgres"),
            env_secret("POSTGRES_PASSWORD", password),
            env_value("PGDATA", format!("{}/pgdata", DATA_PATH)),
        ],
    );
    container.volume_mounts = Some(vec![VolumeMount {
        name: "data".to_string(),
        mount_path: DATA_PATH.to_string(),
        ..Default::default()
    }]);

    let mut pod = builder.build_pod_spec(&spec.deploy, vec![container], service_account);
    pod.volumes = Some(vec![Volume {
        name: "data".to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: name.clone(),
            read_only: None,
        }),
        ..Default::default()
    }]);

    let mut deployment = builder.build_deployment(&name, spec.deploy.replicas.unwrap_or(1), pod);
    // A single writer may hold the volume
    if let Some(deployment_spec) = deployment.spec.as_mut() {
        deployment_spec.strategy = Some(DeploymentStrategy {
            type_: Some("Recreate".to_string()),
            rolling_update: None,
        });
    }

    Ok(vec![
        DesiredChild::new(
            ObjectKind::PersistentVolumeClaim,
            Tier::Storage,
            &builder.build_pvc(&name, &spec.storage),
        )?,
        DesiredChild::new(
            ObjectKind::Service,
            Tier::Storage,
            &builder.build_service(&name, &ports, None),
        )?,
        DesiredChild::new(ObjectKind::Deployment, Tier::Storage, &deployment)?
            .with_checksum_inputs(vec![secret_input(builder.namespace(), password)]),
    ])
}
