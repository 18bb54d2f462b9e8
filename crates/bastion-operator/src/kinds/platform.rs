//! BastionPlatform: one child resource per requested sub-system
//!
//! The platform owns a child custom resource per component, all named after
//! the platform itself, plus the shared database password. The components'
//! own controllers build the workloads.

use super::database::PASSWORD_KEY;
use super::{DATABASE_PORT, GATEWAY_GRPC_PORT, SERVER_GRPC_PORT};
use crate::crd::{
    validation_message, BastionDatabase, BastionDatabaseSpec, BastionEnforcer,
    BastionEnforcerSpec, BastionGateway, BastionGatewaySpec, BastionKubeEnforcer,
    BastionKubeEnforcerSpec, BastionPlatform, BastionServer, BastionServerSpec, BastionStatus,
    DatabaseConnectionSpec, SecretKeyRef, WorkloadSpec, DEFAULT_REGISTRY, DEFAULT_VERSION,
};
use crate::driver::{Approval, ConfigIssue, DesiredChild, ManagedKind};
use crate::error::Result;
use crate::resources::{generate_password, ResourceBuilder, APP_NAME};
use crate::sequencer::Tier;
use crate::store::ObjectKind;
use kube::ResourceExt;
use std::collections::BTreeMap;
use validator::Validate;

const PASSWORD_LENGTH: usize = 32;

impl BastionPlatform {
    /// Shared database password, user-supplied or generated
    pub fn db_password_secret(&self) -> SecretKeyRef {
        self.spec
            .common
            .db_password_secret
            .clone()
            .unwrap_or_else(|| SecretKeyRef {
                name: format!("{}-db-password", self.name_any()),
                key: PASSWORD_KEY.to_string(),
            })
    }

    /// Whether the platform runs its own database
    fn owns_database(&self) -> bool {
        self.spec.database.is_some() && self.spec.external_db.is_none()
    }

    /// Main database the serving tier connects to
    fn connection(&self) -> Option<DatabaseConnectionSpec> {
        if let Some(external) = &self.spec.external_db {
            return Some(external.clone());
        }
        self.owns_database()
            .then(|| self.internal_connection(&format!("{}-database", self.name_any())))
    }

    /// Audit database, only with `splitDb`
    fn audit_connection(&self) -> Option<DatabaseConnectionSpec> {
        if !self.spec.common.split_db {
            return None;
        }
        if self.spec.external_db.is_some() {
            return self.spec.audit_db.clone();
        }
        self.owns_database()
            .then(|| self.internal_connection(&format!("{}-audit-database", self.name_any())))
    }

    fn internal_connection(&self, host: &str) -> DatabaseConnectionSpec {
        DatabaseConnectionSpec {
            host: host.to_string(),
            port: DATABASE_PORT,
            username: "postgres".to_string(),
            password_secret: Some(self.db_password_secret()),
        }
    }

    /// Component settings with the platform's registry, version and pull secrets
    fn inherit(&self, workload: &WorkloadSpec) -> WorkloadSpec {
        let common = &self.spec.common;
        let mut inherited = workload.clone();
        if inherited.image.registry.is_none() {
            inherited.image.registry = common.registry.clone();
        }
        if inherited.image.tag.is_none() {
            inherited.image.tag = common.version.clone();
        }
        if inherited.image_pull_secrets.is_empty() {
            inherited.image_pull_secrets = common.image_pull_secrets.clone();
        }
        inherited
    }

    fn gateway_address(&self) -> String {
        format!("{}-gateway:{}", self.name_any(), GATEWAY_GRPC_PORT)
    }
}

impl ManagedKind for BastionPlatform {
    const COMPONENT: &'static str = "platform";
    const KIND: ObjectKind = ObjectKind::Platform;
    const OWNED: &'static [ObjectKind] = &[
        ObjectKind::Secret,
        ObjectKind::Database,
        ObjectKind::Gateway,
        ObjectKind::Server,
        ObjectKind::Enforcer,
        ObjectKind::KubeEnforcer,
    ];

    fn with_defaults(&self) -> Self {
        let mut defaulted = self.clone();
        let common = &mut defaulted.spec.common;
        if common.registry.as_deref().map_or(true, str::is_empty) {
            common.registry = Some(DEFAULT_REGISTRY.to_string());
        }
        if common.version.as_deref().map_or(true, str::is_empty) {
            common.version = Some(DEFAULT_VERSION.to_string());
        }
        defaulted
    }

    fn spec_errors(&self) -> Option<String> {
        validation_message(self.spec.validate())
    }

    fn preconditions(&self) -> Vec<ConfigIssue> {
        let name = self.name_any();
        let serving_requested = self.spec.gateway.is_some() || self.spec.server.is_some();
        let affecting = |issue: ConfigIssue| {
            issue
                .affecting(ObjectKind::Gateway, name.clone())
                .affecting(ObjectKind::Server, name.clone())
        };
        let mut issues = Vec::new();

        if serving_requested && self.connection().is_none() {
            issues.push(affecting(ConfigIssue::new(
                Tier::Serving,
                "gateway and server need either database or externalDb",
            )));
        }
        if self.spec.common.split_db
            && self.spec.external_db.is_some()
            && self.spec.audit_db.is_none()
        {
            issues.push(affecting(ConfigIssue::new(
                Tier::Serving,
                "splitDb with externalDb requires auditDb",
            )));
        }
        for (requested, token, token_secret, kind) in [
            (
                self.spec.enforcer.is_some(),
                self.spec.enforcer.as_ref().and_then(|e| e.token.as_deref()),
                self.spec.enforcer.as_ref().and_then(|e| e.token_secret.as_ref()),
                ObjectKind::Enforcer,
            ),
            (
                self.spec.kube_enforcer.is_some(),
                self.spec
                    .kube_enforcer
                    .as_ref()
                    .and_then(|e| e.token.as_deref()),
                self.spec
                    .kube_enforcer
                    .as_ref()
                    .and_then(|e| e.token_secret.as_ref()),
                ObjectKind::KubeEnforcer,
            ),
        ] {
            if !requested {
                continue;
            }
            if let Some(issue) = super::enforcer::missing_token_issue(token, token_secret) {
                issues.push(issue.affecting(kind, name.clone()));
            }
        }
        issues
    }

    fn build_children(&self) -> Result<Vec<DesiredChild>> {
        let builder = ResourceBuilder::new(self, Self::COMPONENT)?;
        let name = self.name_any();
        let mut children = Vec::new();

        if self.owns_database() {
            let password = self.db_password_secret();
            if self.spec.common.db_password_secret.is_none() {
                let secret = builder.build_secret(
                    &password.name,
                    BTreeMap::from([(
                        password.key.clone(),
                        generate_password(PASSWORD_LENGTH).into_bytes(),
                    )]),
                );
                children.push(
                    DesiredChild::new(ObjectKind::Secret, Tier::Storage, &secret)?.create_only(),
                );
            }
            let database = self.spec.database.clone().unwrap_or_default();
            let mut child = BastionDatabase::new(
                &name,
                BastionDatabaseSpec {
                    deploy: self.inherit(&database.deploy),
                    storage: database.storage,
                    password_secret: Some(password),
                    split_audit: self.spec.common.split_db,
                },
            );
            child.metadata = builder.with_component("database").metadata(&name);
            children.push(DesiredChild::new(
                ObjectKind::Database,
                Tier::Storage,
                &child,
            )?);
        }

        let connection = self.connection().unwrap_or_else(|| DatabaseConnectionSpec {
            port: DATABASE_PORT,
            ..Default::default()
        });
        let audit = self.audit_connection();

        if let Some(gateway) = &self.spec.gateway {
            let mut child = BastionGateway::new(
                &name,
                BastionGatewaySpec {
                    deploy: self.inherit(gateway),
                    database: connection.clone(),
                    audit_database: audit.clone(),
                    split_db: self.spec.common.split_db,
                    server_address: self
                        .spec
                        .server
                        .as_ref()
                        .map(|_| format!("{}-server:{}", name, SERVER_GRPC_PORT)),
                },
            );
            child.metadata = builder.with_component("gateway").metadata(&name);
            children.push(DesiredChild::new(
                ObjectKind::Gateway,
                Tier::Serving,
                &child,
            )?);
        }

        if let Some(server) = &self.spec.server {
            let mut child = BastionServer::new(
                &name,
                BastionServerSpec {
                    deploy: self.inherit(&server.deploy),
                    database: connection.clone(),
                    audit_database: audit.clone(),
                    split_db: self.spec.common.split_db,
                    admin_password_secret: server.admin_password_secret.clone(),
                    license_secret: server.license_secret.clone(),
                    service_type: server.service_type.clone(),
                    config: server.config.clone(),
                },
            );
            child.metadata = builder.with_component("server").metadata(&name);
            children.push(DesiredChild::new(
                ObjectKind::Server,
                Tier::Serving,
                &child,
            )?);
        }

        // The approval flag gates these writes and is never copied into the children
        if let Some(enforcer) = &self.spec.enforcer {
            let mut child = BastionEnforcer::new(
                &name,
                BastionEnforcerSpec {
                    deploy: self.inherit(&enforcer.deploy),
                    gateway_address: self.gateway_address(),
                    token: enforcer.token.clone(),
                    token_secret: enforcer.token_secret.clone(),
                    update_approved: None,
                },
            );
            child.metadata = builder.with_component("enforcer").metadata(&name);
            children.push(
                DesiredChild::new(ObjectKind::Enforcer, Tier::Enforcement, &child)?.gated(),
            );
        }

        if let Some(kube_enforcer) = &self.spec.kube_enforcer {
            let mut child = BastionKubeEnforcer::new(
                &name,
                BastionKubeEnforcerSpec {
                    deploy: self.inherit(&kube_enforcer.deploy),
                    gateway_address: self.gateway_address(),
                    token: kube_enforcer.token.clone(),
                    token_secret: kube_enforcer.token_secret.clone(),
                    config: kube_enforcer.config.clone(),
                    update_approved: None,
                },
            );
            child.metadata = builder.with_component("kube-enforcer").metadata(&name);
            children.push(
                DesiredChild::new(ObjectKind::KubeEnforcer, Tier::Enforcement, &child)?.gated(),
            );
        }

        Ok(children)
    }

    fn approval(&self) -> Approval {
        Approval::from_flag(self.spec.enforcement.update_approved)
    }

    fn status(&self) -> Option<&BastionStatus> {
        self.status.as_ref()
    }

    /// Pods of every component of this platform
    fn pod_selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app.kubernetes.io/name".to_string(), APP_NAME.to_string()),
            ("app.kubernetes.io/instance".to_string(), self.name_any()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::ApplyPolicy;
    use crate::crd::{
        BastionPlatformSpec, PlatformDatabaseSpec, PlatformEnforcerSpec, PlatformServerSpec,
    };

    fn platform() -> BastionPlatform {
        let mut platform = BastionPlatform::new(
            "prod",
            BastionPlatformSpec {
                database: Some(PlatformDatabaseSpec::default()),
                gateway: Some(WorkloadSpec {
                    replicas: Some(2),
                    ..Default::default()
                }),
                server: Some(PlatformServerSpec::default()),
                enforcer: Some(PlatformEnforcerSpec {
                    token: Some("group-token".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        platform.metadata.namespace = Some("security".to_string());
        platform.metadata.uid = Some("platform-uid".to_string());
        platform
    }

    fn external() -> DatabaseConnectionSpec {
        DatabaseConnectionSpec {
            host: "pg.example.com".to_string(),
            port: 5432,
            username: "bastion".to_string(),
            password_secret: None,
        }
    }

    #[test]
    fn test_children_per_tier() {
        let children = platform().with_defaults().build_children().unwrap();
        let layout: Vec<(ObjectKind, Tier)> = children.iter().map(|c| (c.kind, c.tier)).collect();
        assert_eq!(
            layout,
            vec![
                (ObjectKind::Secret, Tier::Storage),
                (ObjectKind::Database, Tier::Storage),
                (ObjectKind::Gateway, Tier::Serving),
                (ObjectKind::Server, Tier::Serving),
                (ObjectKind::Enforcer, Tier::Enforcement),
            ]
        );
        assert_eq!(children[0].policy, ApplyPolicy::CreateOnly);
        assert_eq!(children[0].name(), "prod-db-password");
        assert!(children[4].gated);
        assert!(children[..4].iter().all(|c| !c.gated));
        assert!(children[1..].iter().all(|c| c.name() == "prod"));
    }

    #[test]
    fn test_children_inherit_common_settings() {
        let mut p = platform();
        p.spec.common.version = Some("2024.9".to_string());
        p.spec.common.image_pull_secrets = vec!["regcred".to_string()];
        let children = p.with_defaults().build_children().unwrap();

        let gateway = &children[2].object.data["spec"];
        assert_eq!(gateway["deploy"]["image"]["tag"], "2024.9");
        assert_eq!(gateway["deploy"]["image"]["registry"], "registry.bastion.dev");
        assert_eq!(gateway["deploy"]["imagePullSecrets"][0], "regcred");
        assert_eq!(gateway["deploy"]["replicas"], 2);
        assert_eq!(gateway["database"]["host"], "prod-database");
        assert_eq!(
            gateway["database"]["passwordSecret"]["name"],
            "prod-db-password"
        );
        assert_eq!(gateway["serverAddress"], "prod-server:8443");

        let enforcer = &children[4].object.data["spec"];
        assert_eq!(enforcer["gatewayAddress"], "prod-gateway:8443");
        assert!(enforcer.get("updateApproved").is_none());
    }

    #[test]
    fn test_approval_flag_is_not_propagated() {
        let mut held = platform();
        held.spec.enforcement.update_approved = Some(false);
        let approved = platform();

        assert_eq!(held.approval(), Approval::Held);
        let held_children = held.with_defaults().build_children().unwrap();
        let approved_children = approved.with_defaults().build_children().unwrap();
        assert_eq!(
            held_children[4].object.data["spec"],
            approved_children[4].object.data["spec"]
        );
    }

    #[test]
    fn test_external_database_skips_storage() {
        let mut p = platform();
        p.spec.external_db = Some(external());
        let children = p.with_defaults().build_children().unwrap();
        assert!(children.iter().all(|c| c.tier != Tier::Storage));
        assert_eq!(
            children[0].object.data["spec"]["database"]["host"],
            "pg.example.com"
        );
    }

    #[test]
    fn test_split_db_with_external_requires_audit() {
        let mut p = platform();
        p.spec.external_db = Some(external());
        p.spec.common.split_db = true;
        let issues = p.preconditions();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("auditDb"));
        assert!(issues[0]
            .affected
            .contains(&(ObjectKind::Gateway, "prod".to_string())));

        p.spec.audit_db = Some(external());
        assert!(p.preconditions().is_empty());
    }

    #[test]
    fn test_serving_without_database() {
        let mut p = platform();
        p.spec.database = None;
        let issues = p.preconditions();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].tier, Tier::Serving);
    }

    #[test]
    fn test_enforcer_without_token() {
        let mut p = platform();
        p.spec.enforcer = Some(PlatformEnforcerSpec::default());
        let issues = p.preconditions();
        assert_eq!(
            issues[0].affected,
            vec![(ObjectKind::Enforcer, "prod".to_string())]
        );
    }

    #[test]
    fn test_internal_split_db_uses_audit_instance() {
        let mut p = platform();
        p.spec.common.split_db = true;
        let children = p.with_defaults().build_children().unwrap();
        assert_eq!(children[1].object.data["spec"]["splitAudit"], true);
        assert_eq!(
            children[3].object.data["spec"]["auditDatabase"]["host"],
            "prod-audit-database"
        );
    }
}
