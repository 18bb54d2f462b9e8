//! BastionKubeEnforcer: admission and cluster-state enforcer (enforcement tier)

use super::enforcer::{missing_token_issue, token_reference, TOKEN_KEY};
use super::{secret_input, service_account_name};
use crate::crd::{
    validation_message, BastionKubeEnforcer, BastionStatus, SecretKeyRef, DEFAULT_REGISTRY,
    DEFAULT_VERSION,
};
use crate::driver::{Approval, ConfigIssue, DesiredChild, ManagedKind};
use crate::error::Result;
use crate::resources::{env_secret, env_value, ResourceBuilder};
use crate::sequencer::Tier;
use crate::store::{ObjectKey, ObjectKind};
use k8s_openapi::api::core::v1::{ConfigMapEnvSource, EnvFromSource};
use k8s_openapi::api::rbac::v1::PolicyRule;
use kube::ResourceExt;
use std::collections::BTreeMap;
use validator::Validate;

const REPOSITORY: &str = "kube-enforcer";
const WEBHOOK_PORT: i32 = 8443;

/// Read access to the workloads the kube-enforcer reports on
fn policy_rules() -> Vec<PolicyRule> {
    let read = || vec!["get".to_string(), "list".to_string(), "watch".to_string()];
    vec![
        PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec![
                "pods".to_string(),
                "configmaps".to_string(),
                "services".to_string(),
            ]),
            verbs: read(),
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["events".to_string()]),
            verbs: vec!["create".to_string(), "patch".to_string()],
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec!["apps".to_string()]),
            resources: Some(vec![
                "deployments".to_string(),
                "daemonsets".to_string(),
                "replicasets".to_string(),
                "statefulsets".to_string(),
            ]),
            verbs: read(),
            ..Default::default()
        },
    ]
}

impl BastionKubeEnforcer {
    pub fn token_secret(&self) -> Option<SecretKeyRef> {
        token_reference(
            &self.name_any(),
            <Self as ManagedKind>::COMPONENT,
            self.spec.token.as_deref(),
            self.spec.token_secret.as_ref(),
        )
    }
}

impl ManagedKind for BastionKubeEnforcer {
    const COMPONENT: &'static str = "kube-enforcer";
    const KIND: ObjectKind = ObjectKind::KubeEnforcer;
    const OWNED: &'static [ObjectKind] = &[
        ObjectKind::ServiceAccount,
        ObjectKind::Role,
        ObjectKind::RoleBinding,
        ObjectKind::ConfigMap,
        ObjectKind::Secret,
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
        missing_token_issue(self.spec.token.as_deref(), self.spec.token_secret.as_ref())
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
        let mut children = Vec::new();

        if deploy.service_account.is_none() {
            children.push(DesiredChild::new(
                ObjectKind::ServiceAccount,
                Tier::Enforcement,
                &builder.build_service_account(&service_account, deploy),
            )?);
        }
        children.push(DesiredChild::new(
            ObjectKind::Role,
            Tier::Enforcement,
            &builder.build_role(&name, policy_rules()),
        )?);
        children.push(DesiredChild::new(
            ObjectKind::RoleBinding,
            Tier::Enforcement,
            &builder.build_role_binding(&name, &name, &service_account),
        )?);
        children.push(DesiredChild::new(
            ObjectKind::ConfigMap,
            Tier::Enforcement,
            &builder.build_config_map(&name, self.spec.config.clone()),
        )?);

        let mut env = vec![env_value(
            "BASTION_GATEWAY_ADDRESS",
            self.spec.gateway_address.clone(),
        )];
        let mut inputs = vec![ObjectKey::new(ObjectKind::ConfigMap, &namespace, &name)];
        if let Some(secret_ref) = self.token_secret() {
            if self.spec.token_secret.is_none() {
                if let Some(token) = self.spec.token.as_deref().filter(|t| !t.is_empty()) {
                    let secret = builder.build_secret(
                        &secret_ref.name,
                        BTreeMap::from([(TOKEN_KEY.to_string(), token.as_bytes().to_vec())]),
                    );
                    children.push(DesiredChild::new(
                        ObjectKind::Secret,
                        Tier::Enforcement,
                        &secret,
                    )?);
                }
            }
            env.push(env_secret("BASTION_TOKEN", &secret_ref));
            inputs.push(secret_input(&namespace, &secret_ref));
        }

        let ports = [("webhook", WEBHOOK_PORT)];
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
            DesiredChild::new(ObjectKind::Deployment, Tier::Enforcement, &deployment)?
                .with_checksum_inputs(inputs),
        );

        Ok(children.into_iter().map(DesiredChild::gated).collect())
    }

    fn approval(&self) -> Approval {
        Approval::from_flag(self.spec.update_approved)
    }

    fn status(&self) -> Option<&BastionStatus> {
        self.status.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::BastionKubeEnforcerSpec;

    fn kube_enforcer() -> BastionKubeEnforcer {
        let mut enforcer = BastionKubeEnforcer::new(
            "prod",
            BastionKubeEnforcerSpec {
                gateway_address: "prod-gateway:8443".to_string(),
                token: Some("group-token".to_string()),
                config: BTreeMap::from([("BASTION_MODE".to_string(), "audit".to_string())]),
                ..Default::default()
            },
        );
        enforcer.metadata.namespace = Some("security".to_string());
        enforcer
    }

    #[test]
    fn test_children() {
        let children = kube_enforcer().with_defaults().build_children().unwrap();
        let kinds: Vec<ObjectKind> = children.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ObjectKind::ServiceAccount,
                ObjectKind::Role,
                ObjectKind::RoleBinding,
                ObjectKind::ConfigMap,
                ObjectKind::Secret,
                ObjectKind::Deployment,
            ]
        );
        assert!(children.iter().all(|c| c.gated));
        assert_eq!(children[4].name(), "prod-kube-enforcer-token");
        assert_eq!(children[5].checksum_inputs.len(), 2);
        assert_eq!(
            children[2].object.data["roleRef"]["name"],
            "prod-kube-enforcer"
        );
    }

    #[test]
    fn test_missing_token_blocks_deployment() {
        let mut enforcer = kube_enforcer();
        enforcer.spec.token = None;
        let issues = enforcer.preconditions();
        assert_eq!(
            issues[0].affected,
            vec![(ObjectKind::Deployment, "prod-kube-enforcer".to_string())]
        );
    }
}
