//! epi-gateway - evidence capture sidecar.
//!
//! Accepts capture events over HTTP, batches them on a background worker,
//! signs each batch and writes it to the evidence vault. On SIGINT/SIGTERM the
//! listener stops accepting connections and the worker drains its queue
//! before the process exits.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use epi_core::redact::Redactor;
use epi_core::trust::{FileKeyStore, KeyId, KeyStore};
use epi_gateway::batch::{BatchSink, FileBatchSink};
use epi_gateway::config::GatewayConfig;
use epi_gateway::worker::{BatchSigner, EvidenceWorker, StopOutcome, WorkerError};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Evidence capture gateway
#[derive(Parser, Debug)]
#[command(name = "epi-gateway")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to gateway configuration file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address from the configuration
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log level filter (e.g. `info`, `epi_gateway=debug`)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Append logs to this file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    let mut config = match &args.config {
        Some(path) => GatewayConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }

    let worker = Arc::new(build_worker(&config)?);
    worker.start().context("failed to start evidence worker")?;

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    let served = epi_gateway::http::serve(listener, Arc::clone(&worker), shutdown_signal()).await;
    if let Err(e) = &served {
        error!("HTTP server error: {e}");
    }

    info!("stopping evidence worker");
    let stopping = Arc::clone(&worker);
    let stopped = tokio::task::spawn_blocking(move || stopping.stop())
        .await
        .context("worker stop task failed")?;
    match stopped {
        Ok(StopOutcome::Stopped | StopOutcome::AlreadyStopped) => {
            info!(
                processed_count = worker.processed_count(),
                failed_batches = worker.failed_batches(),
                dropped_count = worker.dropped_count(),
                discarded_count = worker.discarded_count(),
                "gateway shut down"
            );
        },
        Err(WorkerError::StopTimeout { timeout }) => {
            warn!(
                queue_size = worker.queue_size(),
                "worker did not drain within {timeout:?}; queued evidence may be lost"
            );
            bail!("evidence worker did not stop within {timeout:?}");
        },
        Err(e) => return Err(e).context("failed to stop evidence worker"),
    }

    served.context("HTTP server failed")
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

fn build_worker(config: &GatewayConfig) -> Result<EvidenceWorker> {
    let sink = FileBatchSink::open(&config.worker.storage_dir).with_context(|| {
        format!(
            "failed to open evidence vault {}",
            config.worker.storage_dir.display()
        )
    })?;
    info!(storage_dir = %sink.dir().display(), "evidence vault ready");

    let signer = if config.signing.enabled {
        let key_id = KeyId::new(config.signing.key_id.as_str()).context("invalid signing key id")?;
        let store = FileKeyStore::open(&config.signing.key_dir).with_context(|| {
            format!(
                "failed to open key store {}",
                config.signing.key_dir.display()
            )
        })?;
        let key = store
            .load_or_generate(&key_id)
            .context("failed to load signing key")?;
        info!(
            key_id = %key_id,
            public_key = %store.public_key_path(&key_id).display(),
            "batch signing enabled"
        );
        Some(BatchSigner::new(key, key_id))
    } else {
        warn!("batch signing disabled; persisted evidence will be unsigned");
        None
    };

    Ok(EvidenceWorker::with_parts(
        config.worker.to_worker_config(),
        Arc::new(sink) as Arc<dyn BatchSink>,
        Redactor::new(),
        signer,
    ))
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            warn!("failed to register signal handlers ({e}); falling back to ctrl-c");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for ctrl-c: {e}");
            }
            return;
        },
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {e}");
    }
    info!("Received ctrl-c");
}
