//! Bastion resource kinds
//!
//! Each kind implements [`ManagedKind`](crate::driver::ManagedKind): it
//! defaults and validates its spec and describes the children it wants. The
//! generic driver does everything else.

pub mod database;
pub mod enforcer;
pub mod gateway;
pub mod kube_enforcer;
pub mod platform;
pub mod server;

use crate::crd::{DatabaseConnectionSpec, SecretKeyRef, WorkloadSpec};
use crate::driver::ConfigIssue;
use crate::resources::{env_secret, env_value, ResourceBuilder};
use crate::sequencer::Tier;
use crate::store::{ObjectKey, ObjectKind};
use k8s_openapi::api::core::v1::EnvVar;

pub const DATABASE_PORT: i32 = 5432;
pub const GATEWAY_GRPC_PORT: i32 = 8443;
pub const GATEWAY_HEALTH_PORT: i32 = 8089;
pub const SERVER_HTTP_PORT: i32 = 8080;
pub const SERVER_GRPC_PORT: i32 = 8443;

/// Service account the component's pods run as
fn service_account_name(builder: &ResourceBuilder, deploy: &WorkloadSpec) -> String {
    deploy
        .service_account
        .clone()
        .unwrap_or_else(|| builder.resource_name())
}

/// Connection settings as `BASTION_<prefix>_*` variables
fn database_env(prefix: &str, database: &DatabaseConnectionSpec) -> Vec<EnvVar> {
    let mut env = vec![
        env_value(&format!("BASTION_{}_HOST", prefix), database.host.clone()),
        env_value(&format!("BASTION_{}_PORT", prefix), database.port.to_string()),
        env_value(&format!("BASTION_{}_USER", prefix), database.username.clone()),
    ];
    if let Some(secret) = &database.password_secret {
        env.push(env_secret(&format!("BASTION_{}_PASSWORD", prefix), secret));
    }
    env
}

fn secret_input(namespace: &str, secret: &SecretKeyRef) -> ObjectKey {
    ObjectKey::new(ObjectKind::Secret, namespace, secret.name.clone())
}

/// Password secrets of the main and (when split) audit databases
fn database_inputs(
    namespace: &str,
    database: &DatabaseConnectionSpec,
    audit: Option<&DatabaseConnectionSpec>,
) -> Vec<ObjectKey> {
    let mut inputs: Vec<ObjectKey> = [Some(database), audit]
        .into_iter()
        .flatten()
        .filter_map(|db| db.password_secret.as_ref())
        .map(|secret| secret_input(namespace, secret))
        .collect();
    inputs.sort();
    inputs.dedup();
    inputs
}

/// `splitDb` needs somewhere to put the audit tables
fn split_db_issue(
    split_db: bool,
    audit: Option<&DatabaseConnectionSpec>,
    field: &str,
) -> Option<ConfigIssue> {
    (split_db && audit.is_none()).then(|| {
        ConfigIssue::new(
            Tier::Serving,
            format!("splitDb is enabled but {} is not set", field),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(secret: Option<&str>) -> DatabaseConnectionSpec {
        DatabaseConnectionSpec {
            host: "db".to_string(),
            port: 5432,
            username: "postgres".to_string(),
            password_secret: secret.map(|name| SecretKeyRef {
                name: name.to_string(),
                key: "password".to_string(),
            }),
        }
    }

    #[test]
    fn test_database_env() {
        let env = database_env("DB", &connection(Some("db-pass")));
        let names: Vec<&str> = env.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "BASTION_DB_HOST",
                "BASTION_DB_PORT",
                "BASTION_DB_USER",
                "BASTION_DB_PASSWORD"
            ]
        );
        assert_eq!(database_env("DB", &connection(None)).len(), 3);
    }

    #[test]
    fn test_database_inputs_dedup() {
        let main = connection(Some("shared"));
        let audit = connection(Some("shared"));
        let inputs = database_inputs("default", &main, Some(&audit));
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].name, "shared");
        assert!(database_inputs("default", &connection(None), None).is_empty());
    }

    #[test]
    fn test_split_db_issue() {
        assert!(split_db_issue(false, None, "auditDatabase").is_none());
        assert!(split_db_issue(true, Some(&connection(None)), "auditDatabase").is_none());
        let issue = split_db_issue(true, None, "auditDatabase").unwrap();
        assert_eq!(issue.tier, Tier::Serving);
        assert!(issue.message.contains("auditDatabase"));
    }
}
