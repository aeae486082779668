// ASAP Linux node: chunk storage plus TCP transport running persistent connections.

mod config;
mod transport;

use std::sync::Arc;

use anyhow::Context;
use asap_core::{ChunkStorage, StorageEngine};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: asap-linux [--version] [add <uri> <message>]";

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("asap-linux {}", VERSION);
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = config::load();
    let storage = open_storage(&cfg)?;

    match args.first().map(String::as_str) {
        None => run_daemon(cfg, storage),
        Some("add") => match (args.get(1), args.get(2)) {
            (Some(uri), Some(message)) => {
                storage.add(uri, message)?;
                tracing::info!(%uri, era = storage.era(), "message stored");
                Ok(())
            }
            _ => anyhow::bail!("{}", USAGE),
        },
        Some(other) => anyhow::bail!("unknown command {}\n{}", other, USAGE),
    }
}

fn open_storage(cfg: &config::Config) -> anyhow::Result<Arc<ChunkStorage>> {
    let root = cfg.storage_root();
    let storage = ChunkStorage::create(&cfg.owner, &root, &cfg.format)
        .with_context(|| format!("opening storage at {}", root.display()))?;
    if storage.send_received() != cfg.send_received {
        storage.set_send_received(cfg.send_received)?;
    }
    Ok(Arc::new(storage))
}

fn run_daemon(cfg: config::Config, storage: Arc<ChunkStorage>) -> anyhow::Result<()> {
    let engine = Arc::new(StorageEngine::new(cfg.owner.clone()).with_storage(storage));
    let node = transport::Node::new(engine, cfg.max_execution_time());
    tracing::info!(owner = %cfg.owner, format = %cfg.format, "asap node starting");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let transport_node = node.clone();
        let listen_port = cfg.listen_port;
        let peers = cfg.peers.clone();
        let transport = tokio::spawn(async move {
            transport::run_transport(transport_node, listen_port, peers).await
        });
        tokio::select! {
            res = shutdown_signal() => res?,
            res = transport => {
                res.context("transport task failed")?
                    .with_context(|| format!("listening on port {}", listen_port))?;
            }
        }
        anyhow::Ok(())
    })?;

    tracing::info!(connections = node.connections(), "shutting down");
    node.kill_all();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
