//! Placement driver node.

use std::path::PathBuf;

use clap::Parser;
use rangestream_core::NodeId;
use rangestream_pd::{PdConfig, PdServer, PeerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pd", about = "RangeStream placement driver node")]
struct Args {
    /// This node's id within the PD cluster.
    #[arg(long, default_value_t = 0)]
    node: NodeId,

    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:7070")]
    listen: String,

    /// PD peers as `id@host:port` (repeatable; exclude this node).
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Data directory for the replicated log.
    #[arg(long, default_value = "./data/pd")]
    data_dir: PathBuf,

    /// Leader lease TTL granted to range servers, in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    lease_ttl_ms: u64,

    /// Heartbeat timeout after which a range server is considered dead.
    #[arg(long, default_value_t = 5_000)]
    node_timeout_ms: u64,
}

fn parse_peer(s: &str) -> Result<PeerConfig, String> {
    let (node, address) = s
        .split_once('@')
        .ok_or_else(|| format!("invalid peer '{s}', expected id@host:port"))?;
    Ok(PeerConfig {
        node: node.parse().map_err(|e| format!("invalid peer id: {e}"))?,
        address: address.to_string(),
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let peers = args
        .peers
        .iter()
        .map(|p| parse_peer(p))
        .collect::<Result<Vec<_>, _>>()?;

    let config = PdConfig {
        node: args.node,
        listen_addr: args.listen,
        peers,
        data_dir: args.data_dir,
        lease_ttl_ms: args.lease_ttl_ms,
        node_timeout_ms: args.node_timeout_ms,
        raft_tick_ms: 100,
    };

    let server = PdServer::bind(config).await?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(());
    });

    server.run_until(shutdown_rx).await?;
    Ok(())
}
