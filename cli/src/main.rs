//! fabriclog — checkpointed Hyperledger Fabric event ingestion.
//!
//! Usage:
//! ```bash
//! fabriclog --config-file fabriclog.yaml
//! fabriclog --peer peer0.org1.example.com --msp Org1MSP --network mock \
//!           --user logger --user-key key.pem --user-cert cert.pem --output console
//! ```
//!
//! Startup: flags → tracing → config → checkpoints → sink/router → listener
//! manager → scrapers and HTTP API. Shutdown runs in reverse dependency order
//! under a deadline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fabriclog_core::{CheckpointStore, FileBackend};
use fabriclog_listener::{ListenerConfig, ListenerManager, MockLedgerClient};
use fabriclog_observability::init_tracing;
use fabriclog_output::{ConsoleSink, FileSink, HecSink, NullSink, Router, Sink};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

mod config;
mod flags;
mod prometheus;
mod server;

use config::{FabriclogConfig, OutputConfig};
use flags::Flags;
use prometheus::Scrapers;
use server::ApiServer;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Exit code when shutdown did not complete cleanly.
const EXIT_UNCLEAN_SHUTDOWN: i32 = 2;

struct Running {
    store: CheckpointStore,
    router: Arc<Router>,
    manager: ListenerManager,
    scrapers: Scrapers,
    server: Option<(oneshot::Sender<()>, JoinHandle<std::io::Result<()>>)>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let flags = Flags::parse();

    let schema = config::load_schema(&flags).context("loading configuration")?;
    let log_config = config::log_config(&schema, &flags);
    init_tracing(&log_config).context("initialising tracing")?;
    info!(version = env!("CARGO_PKG_VERSION"), "starting fabriclog");

    let cfg = config::resolve(schema, &flags).context("invalid configuration")?;
    let running = start(cfg).await?;

    wait_for_signal().await;
    info!("received shutdown signal");

    match tokio::time::timeout(SHUTDOWN_DEADLINE, shutdown(running)).await {
        Ok(true) => {
            info!("shutdown complete");
            Ok(())
        }
        Ok(false) => {
            error!("shutdown finished with errors");
            std::process::exit(EXIT_UNCLEAN_SHUTDOWN);
        }
        Err(_) => {
            error!(deadline = ?SHUTDOWN_DEADLINE, "shutdown timed out");
            std::process::exit(EXIT_UNCLEAN_SHUTDOWN);
        }
    }
}

async fn start(cfg: FabriclogConfig) -> Result<Running> {
    let backend = Arc::new(FileBackend::new(&cfg.checkpoint.filename));
    let store = CheckpointStore::load(backend, cfg.checkpoint.save_interval)
        .await
        .context("loading checkpoints")?;

    let sink = build_sink(&cfg).await?;
    info!(sink = sink.name(), "output sink ready");
    let router = Arc::new(Router::new(sink, cfg.router.clone()));

    let fabric = &cfg.fabric;
    info!(peer = %fabric.peer, msp = %fabric.msp, user = %fabric.user, network = %fabric.network_config, "connecting to ledger");
    debug!(
        key_file = %fabric.key_file,
        cert_file = %fabric.cert_file,
        mutual_tls = fabric.client_key_file.is_some() && fabric.client_cert_file.is_some(),
        "user identity"
    );
    let mut listener_config = ListenerConfig::new(&fabric.peer, &fabric.msp).with_retry(fabric.retry.clone());
    listener_config.channels = fabric.channels.clone();
    listener_config.ccevents = fabric.ccevents.clone();
    listener_config.start_block = fabric.start_block;

    let manager = ListenerManager::new(
        Arc::new(MockLedgerClient::new()),
        store.clone(),
        router.clone(),
        listener_config,
    );
    manager
        .listen(&fabric.retry)
        .await
        .context("establishing configured subscriptions")?;

    let scrapers = Scrapers::start(cfg.prometheus.clone(), router.clone());
    info!(scrapers = scrapers.len(), "node metrics scraping started");

    let server = if cfg.server.enabled {
        let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port)
            .parse()
            .with_context(|| format!("invalid server address {}:{}", cfg.server.host, cfg.server.port))?;
        let api = ApiServer::bind(addr, manager.clone())
            .await
            .with_context(|| format!("binding HTTP API to {addr}"))?;
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(api.run(async {
            let _ = stopped.await;
        }));
        Some((stop, handle))
    } else {
        info!("HTTP API disabled");
        None
    };

    Ok(Running {
        store,
        router,
        manager,
        scrapers,
        server,
    })
}

async fn build_sink(cfg: &FabriclogConfig) -> Result<Arc<dyn Sink>> {
    Ok(match &cfg.output {
        OutputConfig::Hec => {
            let hec_config = cfg.hec.clone().context("HEC output selected without URL and token")?;
            let sink = HecSink::new(hec_config).context("creating HEC client")?;
            if !cfg.hec_wait_for_availability.is_zero() {
                sink.wait_until_available(cfg.hec_wait_for_availability)
                    .await
                    .context("waiting for HEC")?;
            }
            Arc::new(sink)
        }
        OutputConfig::File { path } => {
            Arc::new(FileSink::new(path).with_context(|| format!("creating output dir {}", path.display()))?)
        }
        OutputConfig::Console => Arc::new(ConsoleSink::stdout()),
        OutputConfig::Null => Arc::new(NullSink),
    })
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
                return;
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for ctrl-c");
    }
}

/// Stop everything in dependency order. Returns `false` if any step failed.
async fn shutdown(running: Running) -> bool {
    let mut clean = true;

    if let Some((stop, handle)) = running.server {
        let _ = stop.send(());
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "HTTP API failed");
                clean = false;
            }
            Err(e) => {
                error!(error = %e, "HTTP API task panicked");
                clean = false;
            }
        }
    }

    running.scrapers.shutdown().await;
    running.manager.shutdown().await;

    if let Err(e) = running.router.shutdown().await {
        error!(error = %e, "failed to flush output");
        clean = false;
    }
    if let Err(e) = running.store.shutdown().await {
        error!(error = %e, "failed to persist checkpoints");
        clean = false;
    }
    clean
}
