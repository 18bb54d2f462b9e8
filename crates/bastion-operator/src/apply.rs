//! Idempotent create-or-update of child objects
//!
//! The applier never deletes: removal of children is left to garbage
//! collection through the owner reference it stamps on every child.

use crate::compare;
use crate::driver::PassContext;
use crate::error::{OperatorError, Result};
use crate::resources::MANAGER;
use crate::store::{ObjectKey, ObjectKind, ObjectStore};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use tracing::{debug, info};

/// How a child is brought to its desired state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplyPolicy {
    /// Create when absent, update on any managed-field diff
    #[default]
    Converge,
    /// Create when absent, never touch afterwards (generated credentials)
    CreateOnly,
}

/// Result of applying one child
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Created(DynamicObject),
    Updated(DynamicObject),
    Unchanged(DynamicObject),
}

impl ApplyOutcome {
    /// The object as stored after the apply
    pub fn object(&self) -> &DynamicObject {
        match self {
            ApplyOutcome::Created(o) | ApplyOutcome::Updated(o) | ApplyOutcome::Unchanged(o) => o,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Created(_) => "created",
            ApplyOutcome::Updated(_) => "updated",
            ApplyOutcome::Unchanged(_) => "unchanged",
        }
    }
}

/// What applying a child would do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Create,
    Update,
    None,
}

/// Verify the operator still owns a resource before overwriting it.
///
/// An object whose `app.kubernetes.io/managed-by` label names another
/// manager (Helm, another operator) is never overwritten.
pub fn verify_ownership(existing: &DynamicObject) -> Result<()> {
    let managed_by = existing
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get("app.kubernetes.io/managed-by"));
    match managed_by {
        Some(manager) if manager != MANAGER => Err(OperatorError::OwnershipConflict {
            name: existing
                .metadata
                .name
                .clone()
                .unwrap_or_else(|| "<unknown>".to_string()),
            manager: manager.clone(),
        }),
        _ => Ok(()),
    }
}

/// Applies children of one parent
pub struct Applier<'a> {
    store: &'a dyn ObjectStore,
    owner: OwnerReference,
}

impl<'a> Applier<'a> {
    pub fn new(store: &'a dyn ObjectStore, owner: OwnerReference) -> Self {
        Self { store, owner }
    }

    /// Attach the parent's controller reference, replacing any stale copy of it
    pub fn adopt(&self, object: &mut DynamicObject) {
        let owners = object.metadata.owner_references.get_or_insert_with(Vec::new);
        owners.retain(|o| o.uid != self.owner.uid);
        owners.push(self.owner.clone());
    }

    /// Decide what applying `desired` would do, without writing
    pub fn plan(
        &self,
        kind: ObjectKind,
        desired: &DynamicObject,
        observed: Option<&DynamicObject>,
        policy: ApplyPolicy,
    ) -> Result<Change> {
        let Some(observed) = observed else {
            return Ok(Change::Create);
        };
        if policy == ApplyPolicy::CreateOnly {
            return Ok(Change::None);
        }
        let mut desired = desired.clone();
        self.adopt(&mut desired);
        if compare::needs_update(kind, observed, &desired)? {
            Ok(Change::Update)
        } else {
            Ok(Change::None)
        }
    }

    /// Fetch the current object, then converge it
    pub async fn apply(
        &self,
        kind: ObjectKind,
        desired: DynamicObject,
        policy: ApplyPolicy,
        pass: &PassContext,
    ) -> Result<ApplyOutcome> {
        let key = ObjectKey::of(kind, &desired)?;
        let observed = pass.guard("fetch child", self.store.get(&key)).await?;
        self.converge(kind, desired, observed, policy, pass).await
    }

    /// Converge against an observation already made this pass
    pub async fn converge(
        &self,
        kind: ObjectKind,
        mut desired: DynamicObject,
        observed: Option<DynamicObject>,
        policy: ApplyPolicy,
        pass: &PassContext,
    ) -> Result<ApplyOutcome> {
        let key = ObjectKey::of(kind, &desired)?;
        self.adopt(&mut desired);

        let Some(observed) = observed else {
            compare::stamp_last_applied(kind, &mut desired)?;
            let created = pass
                .guard("create child", self.store.create(kind, &desired))
                .await?;
            info!(object = %key, "Created child");
            record_write(kind, "created");
            return Ok(ApplyOutcome::Created(created));
        };

        if policy == ApplyPolicy::CreateOnly {
            return Ok(ApplyOutcome::Unchanged(observed));
        }
        if !compare::needs_update(kind, &observed, &desired)? {
            debug!(object = %key, "Child up to date");
            return Ok(ApplyOutcome::Unchanged(observed));
        }

        verify_ownership(&observed)?;
        let changed = compare::changed_paths(kind, &observed, &desired)?;
        let mut next = compare::overwrite_managed(kind, &observed, &desired)?;
        compare::stamp_last_applied(kind, &mut next)?;
        let updated = pass
            .guard("update child", self.store.replace(kind, &next))
            .await?;
        info!(object = %key, fields = ?changed, "Updated child");
        record_write(kind, "updated");
        Ok(ApplyOutcome::Updated(updated))
    }
}

fn record_write(kind: ObjectKind, outcome: &'static str) {
    metrics::counter!(
        "bastion_operator_child_writes_total",
        "kind" => kind.kind_name(),
        "outcome" => outcome
    )
    .increment(1);
}
