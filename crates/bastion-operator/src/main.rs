//! Bastion Kubernetes Operator
//!
//! Runs one controller per Bastion kind until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use bastion_operator::controller::{self, ControllerSettings};
use bastion_operator::crd;
use bastion_operator::driver::{ConflictBackoff, DriverConfig};
use clap::Parser;
use kube::Client;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// Bastion Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "bastion-operator")]
#[command(about = "Kubernetes operator for the Bastion container security platform")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Objects reconciled concurrently per kind
    #[arg(long, env = "RECONCILE_WORKERS", default_value = "4")]
    workers: u16,

    /// Requeue while children roll out or wait on dependencies
    #[arg(long, env = "PROGRESS_REQUEUE_SECS", default_value = "10")]
    progress_requeue_secs: u64,

    /// Requeue while a configuration precondition fails
    #[arg(long, env = "CONFIG_ERROR_REQUEUE_SECS", default_value = "60")]
    config_error_requeue_secs: u64,

    /// Requeue while a spec fails validation
    #[arg(long, env = "INVALID_SPEC_REQUEUE_SECS", default_value = "300")]
    invalid_spec_requeue_secs: u64,

    /// Base delay of the write-conflict backoff
    #[arg(long, env = "CONFLICT_BACKOFF_MS", default_value = "500")]
    conflict_backoff_ms: u64,

    /// Consecutive write conflicts tolerated before a pass fails
    #[arg(long, env = "CONFLICT_MAX_ATTEMPTS", default_value = "5")]
    conflict_max_attempts: u32,

    /// Upper bound for a single pass
    #[arg(long, env = "PASS_TIMEOUT_SECS", default_value = "120")]
    pass_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crds: bool,
}

impl Args {
    fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            progress_requeue: Duration::from_secs(self.progress_requeue_secs),
            config_error_requeue: Duration::from_secs(self.config_error_requeue_secs),
            invalid_spec_requeue: Duration::from_secs(self.invalid_spec_requeue_secs),
            pass_timeout: Duration::from_secs(self.pass_timeout_secs),
            conflict_backoff: ConflictBackoff {
                base: Duration::from_millis(self.conflict_backoff_ms),
                max_attempts: self.conflict_max_attempts,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crds {
        print_crds()?;
        return Ok(());
    }

    init_logging(&args)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = if args.namespace.is_empty() {
            "all"
        } else {
            args.namespace.as_str()
        },
        "Starting Bastion Kubernetes Operator"
    );

    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });

    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let settings = ControllerSettings {
        namespace: if args.namespace.is_empty() {
            None
        } else {
            Some(args.namespace.clone())
        },
        workers: args.workers,
        driver: args.driver_config(),
    };

    controller::run_all(client, settings, shutdown)
        .await
        .context("Controller failed")?;

    info!("Operator stopped");
    Ok(())
}

/// Initialize logging subsystem
fn init_logging(args: &Args) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM, waiting for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Shutdown requested");
    shutdown.cancel();
}

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    // Keep the server running
    std::future::pending::<()>().await;

    Ok(())
}

/// Start the health probe server
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if socket.read(&mut buf).await.is_ok() {
                let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}

/// Print every CRD as one multi-document YAML stream
fn print_crds() -> Result<()> {
    use kube::CustomResourceExt;

    let crds = [
        crd::BastionPlatform::crd(),
        crd::BastionDatabase::crd(),
        crd::BastionServer::crd(),
        crd::BastionGateway::crd(),
        crd::BastionEnforcer::crd(),
        crd::BastionKubeEnforcer::crd(),
    ];
    for definition in crds {
        println!("---\n{}", serde_yaml::to_string(&definition)?);
    }

    Ok(())
}
