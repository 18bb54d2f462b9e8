//! # Bastion Kubernetes Operator
//!
//! Kubernetes operator that deploys and keeps running the Bastion container
//! security platform: a PostgreSQL storage tier, a serving tier (server and
//! gateway) and an enforcement tier (node enforcers and the kube-enforcer).
//!
//! ## Architecture
//!
//! Every kind is reconciled by the same generic [`driver::Driver`]:
//!
//! 1. **Default and validate** the spec in memory (never written back)
//! 2. **Observe** every desired child read-only and fold readiness per tier
//! 3. **Sequence** tiers: storage before serving, serving before enforcement
//! 4. **Apply** eligible children idempotently, comparing only managed fields
//! 5. **Gate** enforcement updates behind the `updateApproved` flag
//! 6. **Report** one lifecycle state, written only when it changed
//!
//! Kinds describe themselves through [`driver::ManagedKind`]; all I/O goes
//! through [`store::ObjectStore`], so passes run unchanged against the API
//! server ([`store::KubeStore`]) or in process ([`store::MemoryStore`]).
//!
//! ## Custom Resource Definitions
//!
//! ```yaml
//! apiVersion: operator.bastion.dev/v1alpha1
//! kind: BastionPlatform
//! metadata:
//!   name: prod
//! spec:
//!   common:
//!     version: "2024.4"
//!   database:
//!     storage:
//!       size: 50Gi
//!   gateway:
//!     replicas: 2
//!   server:
//!     serviceType: LoadBalancer
//!   enforcer:
//!     tokenSecret:
//!       name: enforcer-token
//!       key: token
//!   enforcement:
//!     updateApproved: false
//! ```
//!
//! `BastionDatabase`, `BastionServer`, `BastionGateway`, `BastionEnforcer`
//! and `BastionKubeEnforcer` can also be created on their own.
//!
//! ## Metrics
//!
//! - `bastion_operator_reconciliations_total{kind}`
//! - `bastion_operator_reconciliation_errors_total{kind}`
//! - `bastion_operator_reconciliation_duration_seconds{kind}`
//! - `bastion_operator_child_writes_total{kind,outcome}`

pub mod apply;
pub mod checksum;
pub mod compare;
pub mod controller;
pub mod crd;
pub mod driver;
pub mod error;
pub mod kinds;
pub mod quantity;
pub mod resources;
pub mod sequencer;
pub mod status;
pub mod store;


pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::apply::{Applier, ApplyOutcome, ApplyPolicy};
    pub use crate::controller::{run_all, run_controller, ControllerContext, ControllerSettings};
    pub use crate::crd::{
        BastionDatabase, BastionDatabaseSpec, BastionEnforcer, BastionEnforcerSpec,
        BastionGateway, BastionGatewaySpec, BastionKubeEnforcer, BastionKubeEnforcerSpec,
        BastionPlatform, BastionPlatformSpec, BastionServer, BastionServerSpec, BastionStatus,
        LifecycleState,
    };
    pub use crate::driver::{
        ConflictBackoff, Driver, DriverConfig, ManagedKind, PassContext, PassOutcome, Requeue,
    };
    pub use crate::error::{OperatorError, Result};
    pub use crate::resources::ResourceBuilder;
    pub use crate::store::{KubeStore, MemoryStore, ObjectKey, ObjectKind, ObjectStore};
}
