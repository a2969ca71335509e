//! `dnsraft`: an authoritative DNS server whose records are replicated
//! across a Raft cluster.
//!
//! Start a three-node cluster on one host:
//! ```bash
//! dnsraft --id n1 --raft-addr 127.0.0.1:15370 --dns-addr 127.0.0.1:5350 --zone-file zone.db
//! dnsraft --id n2 --raft-addr 127.0.0.1:15371 --dns-addr 127.0.0.1:5351 --raft-join 127.0.0.1:15370
//! dnsraft --id n3 --raft-addr 127.0.0.1:15372 --dns-addr 127.0.0.1:5352 --raft-join 127.0.0.1:15370
//! ```
//! `SIGHUP` reloads the zone file; `SIGINT`/`SIGTERM` stop the node.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use dnsraft_common::config::{load_raft_config, NodeConfig};
use dnsraft_server::{serve_tcp, serve_udp, DnsHandler, ZoneLoader};
use dnsraft_storage::{Shutdown, Store, TcpTransport};
use tokio::net::{TcpListener, UdpSocket};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Authoritative DNS backed by a Raft-replicated store")]
struct Cli {
    /// Address to answer DNS queries on (UDP)
    #[arg(long, default_value = "0.0.0.0:5350")]
    dns_addr: String,

    /// Optional address for the JSON-over-TCP record listener
    #[arg(long)]
    tcp_addr: Option<String>,

    /// Raft bus address; peers must be able to reach it
    #[arg(long, default_value = "127.0.0.1:15370")]
    raft_addr: String,

    /// Raft address of any cluster member to join
    #[arg(long)]
    raft_join: Option<String>,

    /// Node identifier (defaults to the raft address)
    #[arg(long)]
    id: Option<String>,

    /// Zone file loaded at startup and on SIGHUP
    #[arg(long)]
    zone_file: Option<PathBuf>,

    /// Origin for relative names in a zone file without $ORIGIN
    #[arg(long)]
    zone_origin: Option<String>,

    /// Directory for the raft log and snapshots; in-memory when absent
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// JSON file with raft timing settings
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Pretty => tracing_subscriber::fmt().pretty().with_env_filter(filter).init(),
    }
}

fn node_config(cli: &Cli) -> Result<NodeConfig> {
    let mut builder = NodeConfig::builder().raft_addr(cli.raft_addr.clone());
    if let Some(id) = &cli.id {
        builder = builder.node_id(id.clone());
    }
    if let Some(dir) = &cli.data_dir {
        builder = builder.data_dir(dir.clone());
    }
    if let Some(path) = &cli.config {
        let raft = load_raft_config(path)
            .with_context(|| format!("failed to load config {}", path.display()))?;
        builder = builder.raft(raft);
    }
    builder.build().context("invalid node configuration")
}

/// Bootstraps or joins on first start; a node with persisted state
/// rejoins its cluster on its own.
async fn start_cluster(store: &Store, join: Option<&str>) -> Result<()> {
    let status = store.status().await.context("store is not running")?;
    if status.term > 0 || status.last_log_index > 0 {
        info!(term = status.term, last_index = status.last_log_index, "resuming from persisted state");
        return Ok(());
    }
    match join {
        Some(target) => store
            .join(target)
            .await
            .with_context(|| format!("failed to join cluster via {}", target)),
        None => store.bootstrap().await.context("failed to bootstrap cluster"),
    }
}

fn spawn_zone_load(loader: Arc<ZoneLoader>) {
    tokio::spawn(async move {
        if let Err(err) = loader.load().await {
            error!(path = %loader.path().display(), error = %err, "zone load failed");
        }
    });
}

#[cfg(unix)]
async fn wait_for_shutdown(loader: Option<Arc<ZoneLoader>>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut interrupt = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    loop {
        tokio::select! {
            _ = hangup.recv() => match &loader {
                Some(loader) => {
                    info!("SIGHUP received, reloading zone");
                    spawn_zone_load(loader.clone());
                }
                None => warn!("SIGHUP received but no zone file configured"),
            },
            _ = terminate.recv() => return Ok(()),
            _ = interrupt.recv() => return Ok(()),
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_loader: Option<Arc<ZoneLoader>>) -> Result<()> {
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = node_config(&cli)?;
    info!(
        node_id = %config.node_id,
        raft_addr = %config.raft_addr,
        dns_addr = %cli.dns_addr,
        "node starting"
    );

    let store = Arc::new(
        Store::open(config, Arc::new(TcpTransport::new()))
            .await
            .context("failed to open store")?,
    );

    let udp = UdpSocket::bind(&cli.dns_addr)
        .await
        .with_context(|| format!("failed to bind DNS socket {}", cli.dns_addr))?;
    let tcp = match &cli.tcp_addr {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind TCP listener {}", addr))?,
        ),
        None => None,
    };

    start_cluster(&store, cli.raft_join.as_deref()).await?;

    let cancel = Shutdown::new();
    let mut servers = Vec::new();
    let handler = Arc::new(DnsHandler::new(store.clone()));
    servers.push(tokio::spawn(serve_udp(udp, handler, cancel.clone())));
    if let Some(listener) = tcp {
        servers.push(tokio::spawn(serve_tcp(listener, store.clone(), cancel.clone())));
    }

    let loader = cli.zone_file.as_ref().map(|path| {
        let loader = ZoneLoader::new(store.clone(), path);
        Arc::new(match &cli.zone_origin {
            Some(origin) => loader.with_origin(origin.clone()),
            None => loader,
        })
    });
    if let Some(loader) = &loader {
        spawn_zone_load(loader.clone());
    }

    wait_for_shutdown(loader).await?;
    info!("shutting down");

    cancel.cancel();
    for server in servers {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "listener exited with error"),
            Err(err) => warn!(error = %err, "listener task panicked"),
        }
    }
    store.stop().await.context("failed to stop store")?;
    info!("stopped");
    Ok(())
}
