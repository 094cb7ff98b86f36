//! cStor Operator
//!
//! Runs the pool cluster and volume claim reconcilers against the cluster.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         cStor Operator                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │    Watch     │───▶│  Work Queue  │───▶│  Reconciler  │       │
//! │  │   Streams    │    │  (per kind)  │    │   Workers    │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use kube::Client;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cstor_operator::controller::{self, ControllerConfig, ImageConfig};
use cstor_operator::crd::all_crds;
use cstor_operator::fault::FaultGate;
use cstor_operator::metrics;

const FAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(10);

// =============================================================================
// CLI Arguments
// =============================================================================

/// cStor Operator - pool and volume controller core
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace holding the pool clusters and volume claims
    #[arg(long, env = "OPENEBS_NAMESPACE", default_value = "openebs")]
    namespace: String,

    /// Name of this pod, used as the provisioning lease holder
    #[arg(long, env = "POD_NAME", default_value = "cstor-operator")]
    pod_name: String,

    /// Version stamped on new objects instead of the build version
    #[arg(long, env = "VERSION_OVERRIDE")]
    version_override: Option<String>,

    /// Pool engine image
    #[arg(long, env = "CSTOR_POOL_IMAGE", default_value = "openebs/cstor-pool:latest")]
    pool_image: String,

    /// Pool management sidecar image
    #[arg(
        long,
        env = "CSTOR_POOL_MGMT_IMAGE",
        default_value = "openebs/cstor-pool-manager:latest"
    )]
    pool_mgmt_image: String,

    /// iSCSI target image
    #[arg(long, env = "CSTOR_TARGET_IMAGE", default_value = "openebs/cstor-istgt:latest")]
    target_image: String,

    /// Volume management sidecar image
    #[arg(
        long,
        env = "CSTOR_VOLUME_MGMT_IMAGE",
        default_value = "openebs/cstor-volume-manager:latest"
    )]
    volume_mgmt_image: String,

    /// Workers per reconciler
    #[arg(long, env = "WORKERS", default_value = "2")]
    workers: usize,

    /// Provisioning lease duration in seconds
    #[arg(long, env = "LEASE_SECONDS", default_value = "60")]
    lease_seconds: u64,

    /// First retry delay in milliseconds
    #[arg(long, env = "BACKOFF_BASE_MS", default_value = "5")]
    backoff_base_ms: u64,

    /// Retry delay cap in seconds
    #[arg(long, env = "BACKOFF_MAX_SECONDS", default_value = "300")]
    backoff_max_seconds: u64,

    /// JSON fault injection config, reloaded periodically
    #[arg(long, env = "FAULT_CONFIG")]
    fault_config: Option<PathBuf>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print every CRD as YAML and exit
    #[arg(long)]
    print_crds: bool,
}

impl Args {
    fn controller_config(&self) -> ControllerConfig {
        let defaults = ControllerConfig::default();
        ControllerConfig {
            namespace: self.namespace.clone(),
            version: self.version_override.clone().unwrap_or(defaults.version),
            pod_id: format!("{}/{}", self.namespace, self.pod_name),
            lease_duration: Duration::from_secs(self.lease_seconds),
            workers: self.workers,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_secs(self.backoff_max_seconds),
            placement_seed: None,
            images: ImageConfig {
                pool: self.pool_image.clone(),
                pool_mgmt: self.pool_mgmt_image.clone(),
                target: self.target_image.clone(),
                volume_mgmt: self.volume_mgmt_image.clone(),
            },
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_crds {
        for crd in all_crds() {
            print!("---\n{}", serde_yaml::to_string(&crd)?);
        }
        return Ok(());
    }

    init_logging(&args)?;

    let config = args.controller_config();
    info!("Starting cStor operator");
    info!("  Namespace: {}", config.namespace);
    info!("  Lease holder: {}", config.pod_id);
    info!("  Version: {}", config.version);
    info!("  Workers per reconciler: {}", config.workers);

    let client = Client::try_default().await.map_err(|e| {
        error!("Failed to create Kubernetes client: {}", e);
        e
    })?;
    info!("Connected to Kubernetes cluster");

    let shutdown = CancellationToken::new();
    let ready = Arc::new(AtomicBool::new(false));

    let faults = FaultGate::disabled();
    if let Some(path) = &args.fault_config {
        faults
            .load_file(path)
            .with_context(|| format!("load fault config {}", path.display()))?;
        faults.spawn_reloader(path.clone(), FAULT_RELOAD_INTERVAL, shutdown.clone());
        info!("  Fault config: {}", path.display());
    }

    let health_addr: SocketAddr = args.health_addr.parse().context("invalid health address")?;
    let health_ready = Arc::clone(&ready);
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_ready).await {
            error!("Health server error: {:#}", e);
        }
    });

    let metrics_addr: SocketAddr = args.metrics_addr.parse().context("invalid metrics address")?;
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    ready.store(true, Ordering::SeqCst);
    controller::run(client, config, faults, shutdown).await?;

    info!("Operator shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("kube=info".parse()?)
        .add_directive("tower=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health & Metrics Servers
// =============================================================================

fn reply(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: SocketAddr, ready: Arc<AtomicBool>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind health server to {}", addr))?;
    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await.context("health server accept")?;
        let io = TokioIo::new(stream);
        let ready = Arc::clone(&ready);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => reply(StatusCode::OK, "ok"),
                        "/readyz" if ready => reply(StatusCode::OK, "ok"),
                        "/readyz" => reply(StatusCode::SERVICE_UNAVAILABLE, "starting"),
                        _ => reply(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Health server connection error: {}", e);
            }
        });
    }
}

async fn run_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    async fn metrics_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => match metrics::render() {
                Ok((content_type, buffer)) => {
                    let mut response = reply(StatusCode::OK, buffer);
                    if let Ok(value) = content_type.parse() {
                        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
                    }
                    response
                }
                Err(e) => reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            },
            _ => reply(StatusCode::NOT_FOUND, "not found"),
        };
        Ok(response)
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind metrics server to {}", addr))?;
    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await.context("metrics server accept")?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
