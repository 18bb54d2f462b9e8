//! BastionServer: console and API server (serving tier)

use super::{
    database_env, database_inputs, secret_input, service_account_name, split_db_issue,
    SERVER_GRPC_PORT, SERVER_HTTP_PORT,
};
use crate::crd::{
    validation_message, BastionServer, BastionStatus, DatabaseConnectionSpec, DEFAULT_REGISTRY,
    DEFAULT_VERSION,
};
use crate::driver::{ConfigIssue, DesiredChild, ManagedKind};
use crate::error::Result;
use crate::resources::{env_secret, ResourceBuilder};
use crate::sequencer::Tier;
use crate::store::{ObjectKey, ObjectKind};
use k8s_openapi::api::core::v1::{ConfigMapEnvSource, EnvFromSource};
use kube::ResourceExt;
use validator::Validate;

const REPOSITORY: &str = "server";

impl BastionServer {
    fn audit_database(&self) -> Option<&DatabaseConnectionSpec> {
        self.spec
            .audit_database
            .as_ref()
            .filter(|_| self.spec.split_db)
    }
}

impl ManagedKind for BastionServer {
    const COMPONENT: &'static str = "server";
    const KIND: ObjectKind = ObjectKind::Server;
    const OWNED: &'static [ObjectKind] = &[
        ObjectKind::ServiceAccount,
        ObjectKind::ConfigMap,
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
            .spec
            .service_type
            .get_or_insert_with(|| "ClusterIP".to_string());
        defaulted
    }

    fn spec_errors(&self) -> Option<String> {
        validation_message(self.spec.validate())
    }

    fn preconditions(&self) -> Vec<ConfigIssue> {
        let name = format!("{}-{}", self.name_any(), Self::COMPONENT);
        split_db_issue(
            self.spec.split_db,
            self.spec.audit_database.as_ref(),
            "auditDatabase",
        )
        .map(|issue| issue.affecting(ObjectKind::Deployment, name))
        .into_iter()
        .collect()
    }

    fn build_children(&self) -> Result<Vec<DesiredChild>> {
        let builder = ResourceBuilder::new(self, Self::COMPONENT)?;
        let name = builder.resource_name();
        let namespace = builder.namespace().to_string();
        let deploy = &self.spec.deploy;
        let service_account = service_account_name(&builder, deploy);
        let ports = [("http", SERVER_HTTP_PORT), ("grpc", SERVER_GRPC_PORT)];
        let mut children = Vec::new();

        if deploy.service_account.is_none() {
            children.push(DesiredChild::new(
                ObjectKind::ServiceAccount,
                Tier::Serving,
                &builder.build_service_account(&service_account, deploy),
            )?);
        }
        children.push(DesiredChild::new(
            ObjectKind::ConfigMap,
            Tier::Serving,
            &builder.build_config_map(&name, self.spec.config.clone()),
        )?);
        children.push(DesiredChild::new(
            ObjectKind::Service,
            Tier::Serving,
            &builder.build_service(&name, &ports, self.spec.service_type.as_deref()),
        )?);

        let mut env = database_env("DB", &self.spec.database);
        if let Some(audit) = self.audit_database() {
            env.extend(database_env("AUDIT_DB", audit));
        }
        let mut inputs = vec![ObjectKey::new(ObjectKind::ConfigMap, &namespace, &name)];
        inputs.extend(database_inputs(
            &namespace,
            &self.spec.database,
            self.audit_database(),
        ));
        if let Some(admin) = &self.spec.admin_password_secret {
            env.push(env_secret("BASTION_ADMIN_PASSWORD", admin));
            inputs.push(secret_input(&namespace, admin));
        }
        if let Some(license) = &self.spec.license_secret {
            env.push(env_secret("BASTION_LICENSE_TOKEN", license));
            inputs.push(secret_input(&namespace, license));
        }
        inputs.sort();
        inputs.dedup();

        let mut container = builder.build_container(deploy, &ports, env);
        container.env_from = Some(vec![EnvFromSource {
            config_map_ref: Some(ConfigMapEnvSource {
                name: name.clone(),
                optional: None,
            }),
            ..Default::default()
        }]);
        let pod = builder.build_pod_spec(deploy, vec![container], &service_account);
        let deployment = builder.build_deployment(&name, deploy.replicas.unwrap_or(1), pod);
        children.push(
            DesiredChild::new(ObjectKind::Deployment, Tier::Serving, &deployment)?
                .with_checksum_inputs(inputs),
        );
        Ok(children)
    }

    fn status(&self) -> Option<&BastionStatus> {
        self.status.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{BastionServerSpec, SecretKeyRef};
    use std::collections::BTreeMap;

    fn server() -> BastionServer {
        let mut server = BastionServer::new(
            "prod",
            BastionServerSpec {
                database: DatabaseConnectionSpec {
                    host: "prod-database".to_string(),
                    port: 5432,
                    username: "postgres".to_string(),
                    password_secret: Some(SecretKeyRef {
                        name: "prod-db-password".to_string(),
                        key: "password".to_string(),
                    }),
                },
                license_secret: Some(SecretKeyRef {
                    name: "license".to_string(),
                    key: "token".to_string(),
                }),
                config: BTreeMap::from([("BASTION_LOG_LEVEL".to_string(), "info".to_string())]),
                ..Default::default()
            },
        );
        server.metadata.namespace = Some("security".to_string());
        server
    }

    #[test]
    fn test_children() {
        let children = server().with_defaults().build_children().unwrap();
        let kinds: Vec<ObjectKind> = children.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ObjectKind::ServiceAccount,
                ObjectKind::ConfigMap,
                ObjectKind::Service,
                ObjectKind::Deployment
            ]
        );
        assert_eq!(children[1].object.data["data"]["BASTION_LOG_LEVEL"], "info");
        assert_eq!(children[2].object.data["spec"]["type"], "ClusterIP");
    }

    #[test]
    fn test_checksum_inputs_cover_config_and_secrets() {
        let children = server().with_defaults().build_children().unwrap();
        let inputs: Vec<(ObjectKind, &str)> = children[3]
            .checksum_inputs
            .iter()
            .map(|k| (k.kind, k.name.as_str()))
            .collect();
        assert_eq!(
            inputs,
            vec![
                (ObjectKind::Secret, "license"),
                (ObjectKind::Secret, "prod-db-password"),
                (ObjectKind::ConfigMap, "prod-server"),
            ]
        );
    }

    #[test]
    fn test_invalid_service_type() {
        let mut srv = server();
        srv.spec.service_type = Some("ExternalName".to_string());
        assert!(srv.with_defaults().spec_errors().is_some());
    }
}
