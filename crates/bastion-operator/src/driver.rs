//! Generic reconciliation driver
//!
//! One [`Driver`] per resource kind runs the same pass for every Bastion
//! kind: default the spec, validate it, observe children, sequence tiers,
//! converge eligible children, fold the lifecycle state, persist status and
//! pick the next requeue. Kinds only describe themselves through
//! [`ManagedKind`].

use crate::apply::{Applier, ApplyPolicy, Change};
use crate::checksum::{self, ChecksumAccumulator};
use crate::crd::{BastionStatus, LifecycleState};
use crate::error::{OperatorError, Result};
use crate::resources::{ResourceBuilder, APP_NAME};
use crate::sequencer::{self, Tier, TierStates};
use crate::status::{self, StatusInputs, StatusReport};
use crate::store::{to_dynamic, ObjectKey, ObjectKind, ObjectStore};
use dashmap::DashMap;
use k8s_openapi::NamespaceResourceScope;
use kube::api::DynamicObject;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// A child the parent wants to exist, as built this pass
#[derive(Debug, Clone)]
pub struct DesiredChild {
    pub kind: ObjectKind,
    pub tier: Tier,
    pub object: DynamicObject,
    pub policy: ApplyPolicy,
    /// Updates wait for the parent's approval flag
    pub gated: bool,
    /// Objects whose content is hashed into the pod template
    pub checksum_inputs: Vec<ObjectKey>,
}

impl DesiredChild {
    pub fn new<T: Serialize>(kind: ObjectKind, tier: Tier, object: &T) -> Result<Self> {
        Ok(Self {
            kind,
            tier,
            object: to_dynamic(object)?,
            policy: ApplyPolicy::Converge,
            gated: false,
            checksum_inputs: Vec::new(),
        })
    }

    pub fn create_only(mut self) -> Self {
        self.policy = ApplyPolicy::CreateOnly;
        self
    }

    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }

    pub fn with_checksum_inputs(mut self, inputs: Vec<ObjectKey>) -> Self {
        self.checksum_inputs = inputs;
        self
    }

    pub fn key(&self) -> Result<ObjectKey> {
        ObjectKey::of(self.kind, &self.object)
    }

    pub fn name(&self) -> &str {
        self.object.metadata.name.as_deref().unwrap_or_default()
    }

    fn describe(&self) -> String {
        format!("{} {}", self.kind, self.name())
    }
}

/// A failed cross-field precondition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub tier: Tier,
    pub message: String,
    /// Children skipped while the issue persists
    pub affected: Vec<(ObjectKind, String)>,
}

impl ConfigIssue {
    pub fn new(tier: Tier, message: impl Into<String>) -> Self {
        Self {
            tier,
            message: message.into(),
            affected: Vec::new(),
        }
    }

    pub fn affecting(mut self, kind: ObjectKind, name: impl Into<String>) -> Self {
        self.affected.push((kind, name.into()));
        self
    }

    fn skips(&self, child: &DesiredChild) -> bool {
        self.affected
            .iter()
            .any(|(kind, name)| *kind == child.kind && name == child.name())
    }
}

/// Tri-state human approval flag: unset or `true` approve, `false` holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Approval {
    Approved,
    Held,
}

impl Approval {
    pub fn from_flag(flag: Option<bool>) -> Self {
        match flag {
            Some(false) => Approval::Held,
            _ => Approval::Approved,
        }
    }
}

/// What a Bastion kind tells the driver about itself
pub trait ManagedKind:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Component label of children the resource owns directly
    const COMPONENT: &'static str;
    /// Store kind of the resource itself
    const KIND: ObjectKind;
    /// Child kinds the controller watches
    const OWNED: &'static [ObjectKind];

    /// Copy with every unset field defaulted
    fn with_defaults(&self) -> Self;

    /// Validation failure of the spec, if any
    fn spec_errors(&self) -> Option<String>;

    /// Cross-field preconditions that do not hold
    fn preconditions(&self) -> Vec<ConfigIssue> {
        Vec::new()
    }

    /// Children for the (defaulted) spec
    fn build_children(&self) -> Result<Vec<DesiredChild>>;

    fn approval(&self) -> Approval {
        Approval::Approved
    }

    fn status(&self) -> Option<&BastionStatus>;

    /// Labels selecting the pods reported in `status.nodes`
    fn pod_selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app.kubernetes.io/name".to_string(), APP_NAME.to_string()),
            ("app.kubernetes.io/instance".to_string(), self.name_any()),
            (
                "app.kubernetes.io/component".to_string(),
                Self::COMPONENT.to_string(),
            ),
        ])
    }

    fn compute_status(&self, inputs: &StatusInputs) -> LifecycleState {
        status::fold(inputs)
    }
}

/// When to run the next pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    Immediately,
    After(Duration),
    /// Only on the next watch event
    AwaitChange,
}

impl From<Requeue> for Action {
    fn from(requeue: Requeue) -> Self {
        match requeue {
            Requeue::Immediately => Action::requeue(Duration::ZERO),
            Requeue::After(delay) => Action::requeue(delay),
            Requeue::AwaitChange => Action::await_change(),
        }
    }
}

/// Non-blocking retry policy for optimistic-lock conflicts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictBackoff {
    pub base: Duration,
    pub max_attempts: u32,
}

impl ConflictBackoff {
    /// Delay before retrying after the `attempt`-th consecutive conflict
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        (attempt >= 1 && attempt <= self.max_attempts).then(|| self.base * attempt)
    }
}

impl Default for ConflictBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max_attempts: 5,
        }
    }
}

/// Driver tuning
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Requeue while children converge or wait on dependencies
    pub progress_requeue: Duration,
    /// Requeue while a precondition fails
    pub config_error_requeue: Duration,
    /// Requeue while the spec is invalid
    pub invalid_spec_requeue: Duration,
    /// Upper bound for one pass
    pub pass_timeout: Duration,
    pub conflict_backoff: ConflictBackoff,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            progress_requeue: Duration::from_secs(10),
            config_error_requeue: Duration::from_secs(60),
            invalid_spec_requeue: Duration::from_secs(300),
            pass_timeout: Duration::from_secs(120),
            conflict_backoff: ConflictBackoff::default(),
        }
    }
}

/// Deadline and cancellation for one pass
#[derive(Debug, Clone)]
pub struct PassContext {
    deadline: Instant,
    cancel: CancellationToken,
}

impl PassContext {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    /// A pass that effectively never times out
    pub fn unbounded() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60), CancellationToken::new())
    }

    /// Race a store call against the deadline and the cancellation token
    pub async fn guard<T, F>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(OperatorError::Cancelled(operation.to_string()));
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(OperatorError::Cancelled(operation.to_string())),
            _ = tokio::time::sleep_until(self.deadline) => {
                Err(OperatorError::Timeout(operation.to_string()))
            }
            result = call => result,
        }
    }
}

/// Result of one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassOutcome {
    pub state: LifecycleState,
    pub requeue: Requeue,
}

/// Child observation made before any write
enum Observation {
    Seen(Option<DynamicObject>),
    Failed,
}

/// Reconciliation driver for one kind
pub struct Driver<K> {
    store: Arc<dyn ObjectStore>,
    config: DriverConfig,
    conflicts: DashMap<String, u32>,
    kind: PhantomData<fn() -> K>,
}

impl<K: ManagedKind> Driver<K> {
    pub fn new(store: Arc<dyn ObjectStore>, config: DriverConfig) -> Self {
        Self {
            store,
            config,
            conflicts: DashMap::new(),
            kind: PhantomData,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Run one pass for `parent`
    #[instrument(skip(self, parent, pass), fields(name = %parent.name_any(), namespace = parent.namespace()))]
    pub async fn reconcile(&self, parent: &K, pass: &PassContext) -> Result<PassOutcome> {
        let tracker = format!(
            "{}/{}",
            parent.namespace().unwrap_or_default(),
            parent.name_any()
        );
        match self.run_pass(parent, pass).await {
            Ok(outcome) => {
                self.conflicts.remove(&tracker);
                Ok(outcome)
            }
            Err(error) if error.is_conflict() => {
                let attempts = {
                    let mut entry = self.conflicts.entry(tracker.clone()).or_insert(0);
                    *entry += 1;
                    *entry
                };
                match self.config.conflict_backoff.delay(attempts) {
                    Some(delay) => {
                        warn!(
                            error = %error,
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            "Write conflict, retrying pass"
                        );
                        Ok(PassOutcome {
                            state: parent.status().map(|s| s.state).unwrap_or_default(),
                            requeue: Requeue::After(delay),
                        })
                    }
                    None => {
                        self.conflicts.remove(&tracker);
                        Err(OperatorError::ConflictRetriesExhausted {
                            resource: format!("{} {}", K::KIND, tracker),
                            attempts,
                        })
                    }
                }
            }
            Err(error) => Err(error),
        }
    }

    async fn run_pass(&self, parent: &K, pass: &PassContext) -> Result<PassOutcome> {
        let namespace = parent
            .namespace()
            .unwrap_or_else(|| "default".to_string());
        let parent_key = ObjectKey::new(K::KIND, namespace.clone(), parent.name_any());
        let spec = parent.with_defaults();

        if let Some(message) = spec.spec_errors() {
            warn!(error = %message, "Spec validation failed");
            let report = StatusReport {
                state: LifecycleState::Pending,
                nodes: parent.status().map(|s| s.nodes.clone()).unwrap_or_default(),
                message: Some(format!("invalid spec: {}", message)),
                invalid_spec: Some(message),
                ..Default::default()
            };
            self.persist_status(parent, &parent_key, &report, pass)
                .await?;
            return Ok(PassOutcome {
                state: LifecycleState::Pending,
                requeue: Requeue::After(self.config.invalid_spec_requeue),
            });
        }

        let issues = spec.preconditions();
        for issue in &issues {
            warn!(
                tier = %issue.tier,
                affected = ?issue.affected,
                error = %issue.message,
                "Configuration error, skipping affected children this pass"
            );
        }

        let mut requested: BTreeSet<Tier> = issues.iter().map(|i| i.tier).collect();
        let mut blocked: BTreeSet<Tier> = requested.clone();
        let children: Vec<DesiredChild> = spec
            .build_children()?
            .into_iter()
            .inspect(|child| {
                requested.insert(child.tier);
            })
            .filter(|child| !issues.iter().any(|issue| issue.skips(child)))
            .collect();

        // Observe everything before writing anything
        let mut observed_tiers = TierStates::new();
        let mut observations = Vec::with_capacity(children.len());
        for child in &children {
            let key = child.key()?;
            match pass.guard("observe child", self.store.get(&key)).await {
                Ok(object) => {
                    observed_tiers.record(child.tier, status::child_state(child.kind, object.as_ref()));
                    observations.push(Observation::Seen(object));
                }
                Err(error @ (OperatorError::Cancelled(_) | OperatorError::Timeout(_))) => {
                    return Err(error)
                }
                Err(error) => {
                    warn!(object = %key, error = %error, "Could not observe child, treating it as not ready");
                    observed_tiers.record(child.tier, crate::sequencer::TierState::Pending);
                    blocked.insert(child.tier);
                    observations.push(Observation::Failed);
                }
            }
        }

        let plan = sequencer::plan(&requested, &observed_tiers);
        for deferral in &plan.deferred {
            info!(
                tier = %deferral.tier,
                blocked_by = %deferral.blocked_by,
                "Tier deferred until its dependency is ready"
            );
        }

        let owner = ResourceBuilder::new(parent, K::COMPONENT)?.owner_reference();
        let applier = Applier::new(self.store.as_ref(), owner);
        let approval = spec.approval();
        let mut tiers = TierStates::new();
        for deferral in &plan.deferred {
            tiers.record(deferral.tier, observed_tiers.get(deferral.tier));
        }
        let mut held = Vec::new();

        for tier in &plan.eligible {
            // Inputs first, so checksums see what was just written
            let mut order: Vec<usize> = (0..children.len())
                .filter(|i| children[*i].tier == *tier)
                .collect();
            order.sort_by_key(|i| !children[*i].kind.is_config_input());

            for index in order {
                let child = &children[index];
                let observed = match &observations[index] {
                    Observation::Seen(object) => object.clone(),
                    Observation::Failed => continue,
                };

                let mut desired = child.object.clone();
                if !child.checksum_inputs.is_empty() {
                    let token = self.checksum(&child.checksum_inputs, pass).await?;
                    checksum::stamp_pod_template(&mut desired, &token);
                }

                if child.gated && approval == Approval::Held {
                    let change = applier.plan(child.kind, &desired, observed.as_ref(), child.policy)?;
                    if change == Change::Update {
                        info!(
                            object = %child.describe(),
                            "Change held until updateApproved is true"
                        );
                        tiers.record(*tier, status::child_state(child.kind, observed.as_ref()));
                        held.push(child.describe());
                        continue;
                    }
                }

                let outcome = applier
                    .converge(child.kind, desired, observed, child.policy, pass)
                    .await?;
                debug!(object = %child.describe(), outcome = outcome.as_str(), "Child applied");
                tiers.record(*tier, status::state_after_apply(child.kind, &outcome));
            }
        }

        let inputs = StatusInputs {
            requested,
            tiers,
            deferred: plan.deferred.clone(),
            held: !held.is_empty(),
            blocked,
        };
        let state = spec.compute_status(&inputs);

        let nodes = match pass
            .guard(
                "list pods",
                self.store
                    .list(ObjectKind::Pod, &namespace, &spec.pod_selector()),
            )
            .await
        {
            Ok(pods) => status::instance_identifiers(&pods),
            Err(error) => {
                warn!(error = %error, "Could not list pods, keeping previous instances");
                parent.status().map(|s| s.nodes.clone()).unwrap_or_default()
            }
        };

        let config_issues: Vec<String> = issues.iter().map(|i| i.message.clone()).collect();
        let report = StatusReport {
            state,
            nodes,
            message: summary(&inputs, &held, &config_issues),
            held,
            config_issues,
            invalid_spec: None,
        };
        self.persist_status(parent, &parent_key, &report, pass)
            .await?;

        let requeue = if !issues.is_empty() {
            Requeue::After(self.config.config_error_requeue)
        } else {
            match state {
                LifecycleState::Running | LifecycleState::UpdatePendingApproval => {
                    Requeue::AwaitChange
                }
                _ => Requeue::After(self.config.progress_requeue),
            }
        };
        debug!(state = %state, ?requeue, "Pass complete");
        Ok(PassOutcome { state, requeue })
    }

    /// Token over the current store content of `inputs`
    async fn checksum(&self, inputs: &[ObjectKey], pass: &PassContext) -> Result<String> {
        let mut accumulator = ChecksumAccumulator::new();
        for key in inputs {
            match pass.guard("read checksum input", self.store.get(key)).await? {
                Some(object) => accumulator.add_object(key.kind, &object)?,
                None => debug!(object = %key, "Checksum input missing, skipped"),
            }
        }
        Ok(accumulator.token())
    }

    /// Write status unless it is equivalent to what is stored
    async fn persist_status(
        &self,
        parent: &K,
        key: &ObjectKey,
        report: &StatusReport,
        pass: &PassContext,
    ) -> Result<()> {
        let previous = parent.status();
        let next = status::build_status(previous, parent.meta().generation, report);
        if previous.is_some_and(|p| status::is_equivalent(p, &next)) {
            debug!("Status unchanged");
            return Ok(());
        }
        let mut value = serde_json::to_value(&next)?;
        // Merge patch: explicit nulls clear fields no longer set
        if let Some(fields) = value.as_object_mut() {
            for field in ["observedGeneration", "message", "lastUpdated"] {
                fields.entry(field).or_insert(Value::Null);
            }
        }
        pass.guard("write status", self.store.patch_status(key, &value))
            .await?;
        info!(state = %next.state, "Status updated");
        Ok(())
    }
}

fn summary(inputs: &StatusInputs, held: &[String], issues: &[String]) -> Option<String> {
    if !held.is_empty() {
        return Some(format!(
            "changes to {} wait for updateApproved",
            held.join(", ")
        ));
    }
    if !issues.is_empty() {
        return Some(issues.join("; "));
    }
    inputs
        .deferred
        .first()
        .map(|d| format!("{} tier waiting for {} tier", d.tier, d.blocked_by))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approval_flag() {
        assert_eq!(Approval::from_flag(None), Approval::Approved);
        assert_eq!(Approval::from_flag(Some(true)), Approval::Approved);
        assert_eq!(Approval::from_flag(Some(false)), Approval::Held);
    }

    #[test]
    fn test_conflict_backoff_is_linear_and_bounded() {
        let backoff = ConflictBackoff {
            base: Duration::from_millis(200),
            max_attempts: 3,
        };
        assert_eq!(backoff.delay(1), Some(Duration::from_millis(200)));
        assert_eq!(backoff.delay(3), Some(Duration::from_millis(600)));
        assert_eq!(backoff.delay(4), None);
        assert_eq!(backoff.delay(0), None);
    }

    #[test]
    fn test_requeue_into_action() {
        assert_eq!(Action::from(Requeue::AwaitChange), Action::await_change());
        assert_eq!(
            Action::from(Requeue::After(Duration::from_secs(5))),
            Action::requeue(Duration::from_secs(5))
        );
    }

    #[tokio::test]
    async fn test_guard_passes_results_through() {
        let pass = PassContext::unbounded();
        let value = pass.guard("noop", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_guard_honours_cancellation() {
        let token = CancellationToken::new();
        let pass = PassContext::new(Duration::from_secs(60), token.clone());
        token.cancel();
        let err = pass
            .guard("blocked", std::future::pending::<Result<()>>())
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::Cancelled(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_times_out() {
        let pass = PassContext::new(Duration::from_millis(50), CancellationToken::new());
        let err = pass
            .guard("slow", std::future::pending::<Result<()>>())
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::Timeout(_)));
    }

    #[test]
    fn test_config_issue_skips_named_child() {
        let child = DesiredChild {
            kind: ObjectKind::Deployment,
            tier: Tier::Serving,
            object: serde_json::from_value(serde_json::json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "prod-server", "namespace": "default"}
            }))
            .unwrap(),
            policy: ApplyPolicy::Converge,
            gated: false,
            checksum_inputs: vec![],
        };
        let issue = ConfigIssue::new(Tier::Serving, "audit database missing")
            .affecting(ObjectKind::Deployment, "prod-server");
        assert!(issue.skips(&child));
        let other = ConfigIssue::new(Tier::Serving, "x").affecting(ObjectKind::Service, "prod-server");
        assert!(!other.skips(&child));
    }
}
