//! BastionEnforcer: per-node runtime enforcer (enforcement tier)
//!
//! Every child is approval-gated: while `updateApproved` is `false` existing
//! children keep running their current revision.

use super::{secret_input, service_account_name};
use crate::crd::{
    validation_message, BastionEnforcer, BastionStatus, SecretKeyRef, DEFAULT_REGISTRY,
    DEFAULT_VERSION,
};
use crate::driver::{Approval, ConfigIssue, DesiredChild, ManagedKind};
use crate::error::Result;
use crate::resources::{env_secret, env_value, ResourceBuilder};
use crate::sequencer::Tier;
use crate::store::ObjectKind;
use k8s_openapi::api::core::v1::{
    Capabilities, EnvVar, EnvVarSource, ObjectFieldSelector, SecurityContext,
};
use kube::ResourceExt;
use std::collections::BTreeMap;
use validator::Validate;

const REPOSITORY: &str = "enforcer";

/// Key of the token in operator-managed token secrets
pub const TOKEN_KEY: &str = "token";

/// Secret reference for an enforcer group token.
///
/// An explicit `tokenSecret` wins; an inline token is stored in an
/// operator-managed secret named `<instance>-<component>-token`.
pub(crate) fn token_reference(
    instance: &str,
    component: &str,
    token: Option<&str>,
    token_secret: Option<&SecretKeyRef>,
) -> Option<SecretKeyRef> {
    match (token_secret, token) {
        (Some(secret), _) => Some(secret.clone()),
        (None, Some(_)) => Some(SecretKeyRef {
            name: format!("{}-{}-token", instance, component),
            key: TOKEN_KEY.to_string(),
        }),
        (None, None) => None,
    }
}

/// Issue raised when neither an inline token nor a token secret is set
pub(crate) fn missing_token_issue(
    token: Option<&str>,
    token_secret: Option<&SecretKeyRef>,
) -> Option<ConfigIssue> {
    (token.map_or(true, str::is_empty) && token_secret.is_none())
        .then(|| ConfigIssue::new(Tier::Enforcement, "either token or tokenSecret is required"))
}

fn node_name_env() -> EnvVar {
    EnvVar {
        name: "BASTION_NODE_NAME".to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: "spec.nodeName".to_string(),
                api_version: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The enforcer inspects containers on its node and needs the host's view
fn enforcer_security_context() -> SecurityContext {
    SecurityContext {
        privileged: Some(true),
        capabilities: Some(Capabilities {
            add: Some(vec!["SYS_ADMIN".to_string(), "NET_ADMIN".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

impl BastionEnforcer {
    pub fn token_secret(&self) -> Option<SecretKeyRef> {
        token_reference(
            &self.name_any(),
            <Self as ManagedKind>::COMPONENT,
            self.spec.token.as_deref(),
            self.spec.token_secret.as_ref(),
        )
    }
}

impl ManagedKind for BastionEnforcer {
    const COMPONENT: &'static str = "enforcer";
    const KIND: ObjectKind = ObjectKind::Enforcer;
    const OWNED: &'static [ObjectKind] = &[
        ObjectKind::ServiceAccount,
        ObjectKind::Secret,
        ObjectKind::DaemonSet,
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
            .map(|issue| issue.affecting(ObjectKind::DaemonSet, name))
            .into_iter()
            .collect()
    }

    fn build_children(&self) -> Result<Vec<DesiredChild>> {
        let builder = ResourceBuilder::new(self, Self::COMPONENT)?;
        let name = builder.resource_name();
        let deploy = &self.spec.deploy;
        let service_account = service_account_name(&builder, deploy);
        let mut children = Vec::new();

        if deploy.service_account.is_none() {
            children.push(
                DesiredChild::new(
                    ObjectKind::ServiceAccount,
                    Tier::Enforcement,
                    &builder.build_service_account(&service_account, deploy),
                )?
                .gated(),
            );
        }

        let mut env = vec![
            env_value("BASTION_GATEWAY_ADDRESS", self.spec.gateway_address.clone()),
            node_name_env(),
        ];
        let mut inputs = Vec::new();
        let token_secret = self.token_secret();
        if let Some(secret_ref) = &token_secret {
            if self.spec.token_secret.is_none() {
                if let Some(token) = self.spec.token.as_deref().filter(|t| !t.is_empty()) {
                    let secret = builder.build_secret(
                        &secret_ref.name,
                        BTreeMap::from([(TOKEN_KEY.to_string(), token.as_bytes().to_vec())]),
                    );
                    children.push(
                        DesiredChild::new(ObjectKind::Secret, Tier::Enforcement, &secret)?.gated(),
                    );
                }
            }
            env.push(env_secret("BASTION_TOKEN", secret_ref));
            inputs.push(secret_input(builder.namespace(), secret_ref));
        }

        let mut container = builder.build_container(deploy, &[], env);
        container.security_context = Some(enforcer_security_context());
        let mut pod = builder.build_pod_spec(deploy, vec![container], &service_account);
        pod.security_context = None;
        pod.host_pid = Some(true);
        let daemon_set = builder.build_daemon_set(&name, pod);
        children.push(
            DesiredChild::new(ObjectKind::DaemonSet, Tier::Enforcement, &daemon_set)?
                .with_checksum_inputs(inputs)
                .gated(),
        );
        Ok(children)
    }

    fn approval(&self) -> Approval {
        Approval::from_flag(self.spec.update_approved)
    }

    fn status(&self) -> Option<&BastionStatus> {
        self.status.as_ref()
    }
}
