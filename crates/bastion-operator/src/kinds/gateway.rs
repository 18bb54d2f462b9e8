//! BastionGateway: the enforcer-facing gateway (serving tier)

use super::{
    database_env, database_inputs, service_account_name, split_db_issue, GATEWAY_GRPC_PORT,
    GATEWAY_HEALTH_PORT, SERVER_GRPC_PORT,
};
use crate::crd::{
    validation_message, BastionGateway, BastionStatus, DEFAULT_REGISTRY, DEFAULT_VERSION,
};
use crate::driver::{ConfigIssue, DesiredChild, ManagedKind};
use crate::error::Result;
use crate::resources::{env_value, ResourceBuilder};
use crate::sequencer::Tier;
use crate::store::ObjectKind;
use kube::ResourceExt;
use validator::Validate;

const REPOSITORY: &str = "gateway";

impl BastionGateway {
    /// Address of the server the gateway forwards to
    pub fn server_address(&self) -> String {
        self.spec
            .server_address
            .clone()
            .unwrap_or_else(|| format!("{}-server:{}", self.name_any(), SERVER_GRPC_PORT))
    }

    fn audit_database(&self) -> Option<&crate::crd::DatabaseConnectionSpec> {
        self.spec
            .audit_database
            .as_ref()
            .filter(|_| self.spec.split_db)
    }
}

impl ManagedKind for BastionGateway {
    const COMPONENT: &'static str = "gateway";
    const KIND: ObjectKind = ObjectKind::Gateway;
    const OWNED: &'static [ObjectKind] = &[
        ObjectKind::ServiceAccount,
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
        let deploy = &self.spec.deploy;
        let service_account = service_account_name(&builder, deploy);
        let ports = [("grpc", GATEWAY_GRPC_PORT), ("health", GATEWAY_HEALTH_PORT)];
        let mut children = Vec::new();

        if deploy.service_account.is_none() {
            children.push(DesiredChild::new(
                ObjectKind::ServiceAccount,
                Tier::Serving,
                &builder.build_service_account(&service_account, deploy),
            )?);
        }
        children.push(DesiredChild::new(
            ObjectKind::Service,
            Tier::Serving,
            &builder.build_service(&name, &ports, None),
        )?);

        let mut env = database_env("DB", &self.spec.database);
        if let Some(audit) = self.audit_database() {
            env.extend(database_env("AUDIT_DB", audit));
        }
        env.push(env_value("BASTION_SERVER_ADDRESS", self.server_address()));
        env.push(env_value(
            "BASTION_HEALTH_PORT",
            GATEWAY_HEALTH_PORT.to_string(),
        ));

        let container = builder.build_container(deploy, &ports, env);
        let pod = builder.build_pod_spec(deploy, vec![container], &service_account);
        let deployment = builder.build_deployment(&name, deploy.replicas.unwrap_or(1), pod);
        children.push(
            DesiredChild::new(ObjectKind::Deployment, Tier::Serving, &deployment)?
                .with_checksum_inputs(database_inputs(
                    builder.namespace(),
                    &self.spec.database,
                    self.audit_database(),
                )),
        );
        Ok(children)
    }

    fn status(&self) -> Option<&BastionStatus> {
        self.status.as_ref()
    }
}
