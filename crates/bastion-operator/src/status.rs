//! Lifecycle state of Bastion resources
//!
//! The state is a projection recomputed every pass: child readiness is
//! folded into tier states, tier states and sequencing decisions are folded
//! into one [`LifecycleState`]. Nothing here performs I/O.

use crate::apply::ApplyOutcome;
use crate::crd::{BastionStatus, LifecycleState, StatusCondition};
use crate::sequencer::{Deferral, Tier, TierState, TierStates};
use crate::store::ObjectKind;
use chrono::Utc;
use kube::api::DynamicObject;
use serde_json::Value;
use std::collections::BTreeSet;

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_APPROVAL_REQUIRED: &str = "ApprovalRequired";
pub const CONDITION_CONFIGURATION_ERROR: &str = "ConfigurationError";
pub const CONDITION_INVALID_SPEC: &str = "InvalidSpec";

fn int_at(object: &DynamicObject, pointer: &str) -> Option<i64> {
    object.data.pointer(pointer).and_then(Value::as_i64)
}

/// Readiness of one observed child; absent children are `Pending`
pub fn child_state(kind: ObjectKind, observed: Option<&DynamicObject>) -> TierState {
    let Some(object) = observed else {
        return TierState::Pending;
    };
    let generation = object.metadata.generation.unwrap_or(1);
    let observed_generation = int_at(object, "/status/observedGeneration");
    let current = observed_generation.is_some_and(|g| g >= generation);

    match kind {
        ObjectKind::Deployment => {
            let desired = int_at(object, "/spec/replicas").unwrap_or(1);
            let ready = int_at(object, "/status/readyReplicas").unwrap_or(0);
            let updated = int_at(object, "/status/updatedReplicas").unwrap_or(0);
            workload_state(generation, current, desired, ready, updated)
        }
        ObjectKind::DaemonSet => {
            let desired = int_at(object, "/status/desiredNumberScheduled").unwrap_or(0);
            let ready = int_at(object, "/status/numberReady").unwrap_or(0);
            let updated = int_at(object, "/status/updatedNumberScheduled").unwrap_or(0);
            workload_state(generation, current, desired, ready, updated)
        }
        kind if kind.is_custom() => {
            let reported = object
                .data
                .pointer("/status/state")
                .and_then(Value::as_str)
                .and_then(LifecycleState::parse);
            match reported {
                Some(LifecycleState::Running) if current => TierState::Running,
                Some(LifecycleState::Running)
                | Some(LifecycleState::UpdateInProgress)
                | Some(LifecycleState::UpdatePendingApproval) => TierState::UpdateInProgress,
                _ => TierState::Pending,
            }
        }
        _ => TierState::Running,
    }
}

/// A workload only counts as rolling out while its controller has not caught
/// up with the latest generation or pods still run an older template. A
/// current, fully updated workload short of ready pods is `Pending`.
fn workload_state(
    generation: i64,
    current: bool,
    desired: i64,
    ready: i64,
    updated: i64,
) -> TierState {
    let rolling = generation > 1 && (!current || updated < desired);
    if current && ready >= desired && updated >= desired {
        TierState::Running
    } else if rolling {
        TierState::UpdateInProgress
    } else {
        TierState::Pending
    }
}

/// Readiness of a child right after the applier handled it
pub fn state_after_apply(kind: ObjectKind, outcome: &ApplyOutcome) -> TierState {
    let rolls = kind.is_workload() || kind.is_custom();
    match outcome {
        ApplyOutcome::Created(_) if rolls => TierState::Pending,
        ApplyOutcome::Updated(_) if rolls => TierState::UpdateInProgress,
        ApplyOutcome::Created(_) | ApplyOutcome::Updated(_) => TierState::Running,
        ApplyOutcome::Unchanged(object) => child_state(kind, Some(object)),
    }
}

/// Everything the state fold looks at
#[derive(Debug, Clone, Default)]
pub struct StatusInputs {
    /// Tiers the spec asks for
    pub requested: BTreeSet<Tier>,
    /// Tier states after this pass's writes
    pub tiers: TierStates,
    /// Tiers the sequencer held back
    pub deferred: Vec<Deferral>,
    /// A gated change was withheld for approval
    pub held: bool,
    /// Tiers with a child skipped this pass
    pub blocked: BTreeSet<Tier>,
}

/// Fold the inputs into one lifecycle state, highest priority first
pub fn fold(inputs: &StatusInputs) -> LifecycleState {
    if inputs.held {
        return LifecycleState::UpdatePendingApproval;
    }
    // Deferrals are in tier order, so the earliest blocker wins
    if let Some(deferral) = inputs.deferred.first() {
        return deferral.lifecycle_state();
    }
    let requested = || inputs.requested.iter().map(|t| inputs.tiers.get(*t));
    if requested().any(|s| s == TierState::UpdateInProgress) {
        return LifecycleState::UpdateInProgress;
    }
    if inputs.blocked.is_empty() && requested().all(|s| s == TierState::Running) {
        return LifecycleState::Running;
    }
    LifecycleState::Pending
}

/// Observations the status document is built from
#[derive(Debug, Clone, Default)]
pub struct StatusReport {
    pub state: LifecycleState,
    pub nodes: Vec<String>,
    pub message: Option<String>,
    /// Children withheld for approval
    pub held: Vec<String>,
    /// Failed cross-field preconditions
    pub config_issues: Vec<String>,
    /// Validation failure of the spec itself
    pub invalid_spec: Option<String>,
}

/// Instance identifiers (`pod@node`) for the status, sorted
pub fn instance_identifiers(pods: &[DynamicObject]) -> Vec<String> {
    let mut nodes: Vec<String> = pods
        .iter()
        .filter_map(|pod| {
            let name = pod.metadata.name.as_deref()?;
            Some(
                match pod.data.pointer("/spec/nodeName").and_then(Value::as_str) {
                    Some(node) => format!("{}@{}", name, node),
                    None => name.to_string(),
                },
            )
        })
        .collect();
    nodes.sort();
    nodes
}

/// Build the next status, keeping transition times of unchanged conditions
pub fn build_status(
    previous: Option<&BastionStatus>,
    generation: Option<i64>,
    report: &StatusReport,
) -> BastionStatus {
    let now = Utc::now().to_rfc3339();
    let mut conditions = vec![condition(
        CONDITION_READY,
        report.state == LifecycleState::Running,
        report.state.as_str(),
        report.message.clone(),
    )];
    if !report.held.is_empty() {
        conditions.push(condition(
            CONDITION_APPROVAL_REQUIRED,
            true,
            "UpdateHeld",
            Some(format!(
                "set updateApproved to true to roll out changes to {}",
                report.held.join(", ")
            )),
        ));
    }
    if !report.config_issues.is_empty() {
        conditions.push(condition(
            CONDITION_CONFIGURATION_ERROR,
            true,
            "PreconditionFailed",
            Some(report.config_issues.join("; ")),
        ));
    }
    if let Some(message) = &report.invalid_spec {
        conditions.push(condition(
            CONDITION_INVALID_SPEC,
            true,
            "ValidationFailed",
            Some(message.clone()),
        ));
    }

    for condition in &mut conditions {
        let kept = previous
            .into_iter()
            .flat_map(|s| s.conditions.iter())
            .find(|c| c.condition_type == condition.condition_type && c.status == condition.status)
            .and_then(|c| c.last_transition_time.clone());
        condition.last_transition_time = Some(kept.unwrap_or_else(|| now.clone()));
    }

    BastionStatus {
        state: report.state,
        observed_generation: generation,
        nodes: report.nodes.clone(),
        conditions,
        message: report.message.clone(),
        last_updated: Some(now),
    }
}

fn condition(
    condition_type: &str,
    status: bool,
    reason: &str,
    message: Option<String>,
) -> StatusCondition {
    StatusCondition {
        condition_type: condition_type.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: Some(reason.to_string()),
        message,
        last_transition_time: None,
    }
}

/// Equality ignoring timestamps
pub fn is_equivalent(a: &BastionStatus, b: &BastionStatus) -> bool {
    fn strip(status: &BastionStatus) -> BastionStatus {
        let mut status = status.clone();
        status.last_updated = None;
        for condition in &mut status.conditions {
            condition.last_transition_time = None;
        }
        status
    }
    strip(a) == strip(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> DynamicObject {
        serde_json::from_value(value).unwrap()
    }

    fn deployment(generation: i64, status: Value) -> DynamicObject {
        object(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "prod-gateway", "generation": generation},
            "spec": {"replicas": 2},
            "status": status
        }))
    }

    fn inputs(requested: &[Tier], states: &[(Tier, TierState)]) -> StatusInputs {
        let mut tiers = TierStates::new();
        for (tier, state) in states {
            tiers.record(*tier, *state);
        }
        StatusInputs {
            requested: requested.iter().copied().collect(),
            tiers,
            ..Default::default()
        }
    }

    #[test]
    fn test_deployment_readiness() {
        let ready = deployment(
            1,
            json!({"observedGeneration": 1, "readyReplicas": 2, "updatedReplicas": 2}),
        );
        assert_eq!(
            child_state(ObjectKind::Deployment, Some(&ready)),
            TierState::Running
        );

        let fresh = deployment(1, json!({}));
        assert_eq!(
            child_state(ObjectKind::Deployment, Some(&fresh)),
            TierState::Pending
        );

        let rolling = deployment(
            3,
            json!({"observedGeneration": 3, "readyReplicas": 1, "updatedReplicas": 1}),
        );
        assert_eq!(
            child_state(ObjectKind::Deployment, Some(&rolling)),
            TierState::UpdateInProgress
        );

        let stale = deployment(
            2,
            json!({"observedGeneration": 1, "readyReplicas": 2, "updatedReplicas": 2}),
        );
        assert_eq!(
            child_state(ObjectKind::Deployment, Some(&stale)),
            TierState::UpdateInProgress
        );
    }

    #[test]
    fn test_lost_readiness_is_not_a_rollout() {
        for generation in [1, 2] {
            let degraded = deployment(
                generation,
                json!({
                    "observedGeneration": generation,
                    "replicas": 2,
                    "readyReplicas": 1,
                    "updatedReplicas": 2
                }),
            );
            assert_eq!(
                child_state(ObjectKind::Deployment, Some(&degraded)),
                TierState::Pending,
                "generation {}",
                generation
            );
        }

        let daemon_set = |generation: i64, ready: i64, updated: i64| {
            object(json!({
                "apiVersion": "apps/v1",
                "kind": "DaemonSet",
                "metadata": {"name": "prod-enforcer", "generation": generation},
                "spec": {},
                "status": {
                    "observedGeneration": generation,
                    "desiredNumberScheduled": 3,
                    "numberReady": ready,
                    "updatedNumberScheduled": updated
                }
            }))
        };
        assert_eq!(
            child_state(ObjectKind::DaemonSet, Some(&daemon_set(2, 2, 3))),
            TierState::Pending
        );
        assert_eq!(
            child_state(ObjectKind::DaemonSet, Some(&daemon_set(2, 2, 1))),
            TierState::UpdateInProgress
        );
        assert_eq!(
            child_state(ObjectKind::DaemonSet, Some(&daemon_set(2, 3, 3))),
            TierState::Running
        );
    }

    #[test]
    fn test_custom_child_readiness() {
        let running = object(json!({
            "apiVersion": "operator.bastion.dev/v1alpha1",
            "kind": "BastionDatabase",
            "metadata": {"name": "prod", "generation": 2},
            "spec": {},
            "status": {"state": "Running", "observedGeneration": 2}
        }));
        assert_eq!(
            child_state(ObjectKind::Database, Some(&running)),
            TierState::Running
        );

        let mut lagging = running.clone();
        lagging.metadata.generation = Some(3);
        assert_eq!(
            child_state(ObjectKind::Database, Some(&lagging)),
            TierState::UpdateInProgress
        );

        let waiting = object(json!({
            "apiVersion": "operator.bastion.dev/v1alpha1",
            "kind": "BastionServer",
            "metadata": {"name": "prod", "generation": 1},
            "spec": {},
            "status": {"state": "WaitingOnDependency"}
        }));
        assert_eq!(
            child_state(ObjectKind::Server, Some(&waiting)),
            TierState::Pending
        );
    }

    #[test]
    fn test_absent_child_is_pending() {
        assert_eq!(child_state(ObjectKind::Secret, None), TierState::Pending);
        assert_eq!(child_state(ObjectKind::Deployment, None), TierState::Pending);
    }

    #[test]
    fn test_fold_priorities() {
        let mut held = inputs(&[Tier::Enforcement], &[(Tier::Enforcement, TierState::Running)]);
        held.held = true;
        assert_eq!(fold(&held), LifecycleState::UpdatePendingApproval);

        let mut waiting = inputs(
            &[Tier::Storage, Tier::Serving],
            &[(Tier::Storage, TierState::UpdateInProgress)],
        );
        waiting.deferred = vec![Deferral {
            tier: Tier::Serving,
            blocked_by: Tier::Storage,
        }];
        assert_eq!(fold(&waiting), LifecycleState::WaitingOnDependency);

        let mut enforcement = inputs(
            &[Tier::Serving, Tier::Enforcement],
            &[(Tier::Serving, TierState::Pending)],
        );
        enforcement.deferred = vec![Deferral {
            tier: Tier::Enforcement,
            blocked_by: Tier::Serving,
        }];
        assert_eq!(fold(&enforcement), LifecycleState::EnforcementWaiting);

        let rolling = inputs(
            &[Tier::Storage, Tier::Serving],
            &[
                (Tier::Storage, TierState::Running),
                (Tier::Serving, TierState::UpdateInProgress),
            ],
        );
        assert_eq!(fold(&rolling), LifecycleState::UpdateInProgress);

        let running = inputs(
            &[Tier::Storage, Tier::Serving],
            &[
                (Tier::Storage, TierState::Running),
                (Tier::Serving, TierState::Running),
            ],
        );
        assert_eq!(fold(&running), LifecycleState::Running);

        let mut blocked = running.clone();
        blocked.blocked.insert(Tier::Serving);
        assert_eq!(fold(&blocked), LifecycleState::Pending);
    }

    #[test]
    fn test_build_status_keeps_transition_times() {
        let report = StatusReport {
            state: LifecycleState::Running,
            ..Default::default()
        };
        let mut first = build_status(None, Some(1), &report);
        first.conditions[0].last_transition_time = Some("2024-01-01T00:00:00Z".to_string());

        let second = build_status(Some(&first), Some(1), &report);
        assert_eq!(
            second.conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
        assert!(is_equivalent(&first, &second));

        let pending = StatusReport::default();
        let third = build_status(Some(&second), Some(1), &pending);
        assert_ne!(
            third.conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
        assert!(!is_equivalent(&second, &third));
    }

    #[test]
    fn test_conditions_reflect_report() {
        let report = StatusReport {
            state: LifecycleState::UpdatePendingApproval,
            held: vec!["DaemonSet prod-enforcer".to_string()],
            config_issues: vec!["token missing".to_string()],
            ..Default::default()
        };
        let status = build_status(None, Some(4), &report);
        let types: Vec<&str> = status
            .conditions
            .iter()
            .map(|c| c.condition_type.as_str())
            .collect();
        assert_eq!(
            types,
            vec![
                CONDITION_READY,
                CONDITION_APPROVAL_REQUIRED,
                CONDITION_CONFIGURATION_ERROR
            ]
        );
        assert_eq!(status.observed_generation, Some(4));
    }

    #[test]
    fn test_instance_identifiers() {
        let pods = vec![
            object(json!({"apiVersion": "v1", "kind": "Pod",
                "metadata": {"name": "b"}, "spec": {"nodeName": "node-1"}})),
            object(json!({"apiVersion": "v1", "kind": "Pod",
                "metadata": {"name": "a"}, "spec": {}})),
        ];
        assert_eq!(instance_identifiers(&pods), vec!["a", "b@node-1"]);
    }
}
