//! Controller wiring
//!
//! One kube-runtime [`Controller`] per Bastion kind. Each watches its
//! resources and the child kinds it owns and hands every event to the
//! generic [`Driver`].

use crate::crd::{
    BastionDatabase, BastionEnforcer, BastionGateway, BastionKubeEnforcer, BastionPlatform,
    BastionServer,
};
use crate::driver::{Driver, DriverConfig, ManagedKind, PassContext};
use crate::error::{OperatorError, Result};
use crate::store::{KubeStore, ObjectStore};
use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::runtime::controller::{Action, Config as ControllerConfig, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Requeue interval for error cases (base for exponential backoff)
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Context passed to the controller of one kind
pub struct ControllerContext<K> {
    pub driver: Driver<K>,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-object error retry counts for exponential backoff
    pub error_counts: dashmap::DashMap<String, u32>,
    /// Cancelled on shutdown; every pass gets a child token
    pub shutdown: CancellationToken,
}

impl<K: ManagedKind> ControllerContext<K> {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        config: DriverConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            driver: Driver::new(store, config),
            metrics: Some(ControllerMetrics::new(K::COMPONENT)),
            error_counts: dashmap::DashMap::new(),
            shutdown,
        }
    }
}

/// Metrics for one controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    pub fn new(kind: &'static str) -> Self {
        Self {
            reconciliations: metrics::counter!("bastion_operator_reconciliations_total", "kind" => kind),
            errors: metrics::counter!("bastion_operator_reconciliation_errors_total", "kind" => kind),
            duration: metrics::histogram!("bastion_operator_reconciliation_duration_seconds", "kind" => kind),
        }
    }
}

/// Settings shared by every controller
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Namespace to watch, all when `None`
    pub namespace: Option<String>,
    /// Objects reconciled concurrently per kind
    pub workers: u16,
    pub driver: DriverConfig,
}

fn tracker<K: ManagedKind>(parent: &K) -> String {
    format!(
        "{}/{}",
        parent.namespace().unwrap_or_default(),
        parent.name_any()
    )
}

/// Start the controller for one kind and run it until shutdown
pub async fn run_controller<K>(
    client: Client,
    settings: ControllerSettings,
    shutdown: CancellationToken,
) -> Result<()>
where
    K: ManagedKind,
{
    let namespace = settings.namespace.clone();
    let parents: Api<K> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(client.clone()));
    let ctx = Arc::new(ControllerContext::<K>::new(
        store,
        settings.driver.clone(),
        shutdown.clone(),
    ));

    info!(
        kind = K::COMPONENT,
        namespace = namespace.as_deref().unwrap_or("all"),
        workers = settings.workers,
        "Starting controller"
    );

    let mut controller = Controller::new(parents, Config::default())
        .with_config(ControllerConfig::default().concurrency(settings.workers));

    // Watch owned children so drift and readiness changes trigger a pass
    for kind in K::OWNED {
        let resource = kind.api_resource();
        let children: Api<DynamicObject> = match &namespace {
            Some(ns) => Api::namespaced_with(client.clone(), ns, &resource),
            None => Api::all_with(client.clone(), &resource),
        };
        controller = controller.owns_with(children, resource, Config::default());
    }

    controller
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .run(reconcile::<K>, error_policy::<K>, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    info!(kind = K::COMPONENT, "Controller stopped");
    Ok(())
}

/// Run the controllers of every Bastion kind
pub async fn run_all(
    client: Client,
    settings: ControllerSettings,
    shutdown: CancellationToken,
) -> Result<()> {
    tokio::try_join!(
        run_controller::<BastionPlatform>(client.clone(), settings.clone(), shutdown.clone()),
        run_controller::<BastionDatabase>(client.clone(), settings.clone(), shutdown.clone()),
        run_controller::<BastionServer>(client.clone(), settings.clone(), shutdown.clone()),
        run_controller::<BastionGateway>(client.clone(), settings.clone(), shutdown.clone()),
        run_controller::<BastionEnforcer>(client.clone(), settings.clone(), shutdown.clone()),
        run_controller::<BastionKubeEnforcer>(client, settings, shutdown),
    )?;
    Ok(())
}

/// One pass for one object
#[instrument(skip(parent, ctx), fields(kind = K::COMPONENT, name = %parent.name_any(), namespace = parent.namespace()))]
async fn reconcile<K: ManagedKind>(
    parent: Arc<K>,
    ctx: Arc<ControllerContext<K>>,
) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let pass = PassContext::new(
        ctx.driver.config().pass_timeout,
        ctx.shutdown.child_token(),
    );
    let result = ctx.driver.reconcile(parent.as_ref(), &pass).await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    match result {
        Ok(outcome) => {
            // Reset error backoff counter on success
            ctx.error_counts.remove(&tracker(parent.as_ref()));
            debug!(state = %outcome.state, requeue = ?outcome.requeue, "Pass finished");
            Ok(outcome.requeue.into())
        }
        Err(e) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.errors.increment(1);
            }
            Err(e)
        }
    }
}

/// Error policy for the controller: exponential backoff per object
fn error_policy<K: ManagedKind>(
    parent: Arc<K>,
    error: &OperatorError,
    ctx: Arc<ControllerContext<K>>,
) -> Action {
    let key = tracker(parent.as_ref());
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    // The error's own delay, else 30s → 60s → 120s → 240s → 480s → 600s (capped)
    let delay = error.requeue_delay().unwrap_or_else(|| {
        let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
        let backoff = base * 2u32.saturating_pow((retries - 1).min(5));
        backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
    });

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::BastionGatewaySpec;
    use crate::store::{MemoryStore, ObjectKind};

    fn context() -> Arc<ControllerContext<BastionGateway>> {
        Arc::new(ControllerContext::new(
            Arc::new(MemoryStore::new()),
            DriverConfig::default(),
            CancellationToken::new(),
        ))
    }

    fn gateway() -> Arc<BastionGateway> {
        let mut gateway = BastionGateway::new("prod", BastionGatewaySpec::default());
        gateway.metadata.namespace = Some("security".to_string());
        Arc::new(gateway)
    }

    #[test]
    fn test_error_policy_backs_off_exponentially() {
        let ctx = context();
        let error = OperatorError::InvalidConfig("boom".to_string());
        let delays: Vec<Action> = (0..7)
            .map(|_| error_policy(gateway(), &error, ctx.clone()))
            .collect();
        assert_eq!(delays[0], Action::requeue(Duration::from_secs(30)));
        assert_eq!(delays[1], Action::requeue(Duration::from_secs(60)));
        assert_eq!(delays[4], Action::requeue(Duration::from_secs(480)));
        assert_eq!(delays[6], Action::requeue(Duration::from_secs(600)));
        assert_eq!(*ctx.error_counts.get("security/prod").unwrap(), 7);
    }

    #[test]
    fn test_error_policy_prefers_error_delay() {
        let ctx = context();
        let error = OperatorError::Conflict {
            kind: "Deployment".to_string(),
            name: "prod-gateway".to_string(),
            message: "stale".to_string(),
        };
        assert_eq!(
            error_policy(gateway(), &error, ctx),
            Action::requeue(Duration::from_secs(1))
        );
    }

    #[tokio::test]
    async fn test_reconcile_resets_error_count() {
        let store = Arc::new(MemoryStore::new());
        let key = store
            .insert_typed(ObjectKind::Gateway, gateway().as_ref())
            .unwrap();
        let ctx = Arc::new(ControllerContext::<BastionGateway>::new(
            store.clone(),
            DriverConfig::default(),
            CancellationToken::new(),
        ));
        ctx.error_counts.insert("security/prod".to_string(), 3);

        // An invalid spec is reported through status, not as an error
        let parent: BastionGateway = store.peek_typed(&key).unwrap();
        let action = reconcile(Arc::new(parent), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(300)));
        assert!(ctx.error_counts.get("security/prod").is_none());

        let stored: BastionGateway = store.peek_typed(&key).unwrap();
        let status = stored.status.unwrap();
        assert!(status
            .conditions
            .iter()
            .any(|c| c.condition_type == "InvalidSpec"));
    }
}
