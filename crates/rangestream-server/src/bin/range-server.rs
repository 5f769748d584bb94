//! Range server node.

use std::path::PathBuf;

use clap::Parser;
use rangestream_core::NodeId;
use rangestream_server::{RangeServer, RangeServerConfig, SyncPolicy};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "range-server", about = "RangeStream range server node")]
struct Args {
    /// This node's id within the range-server cluster.
    #[arg(long)]
    node: NodeId,

    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:7100")]
    listen: String,

    /// Address advertised to the PD (defaults to the listen address).
    #[arg(long)]
    advertise: Option<String>,

    /// PD endpoints (repeatable).
    #[arg(long = "pd", required = true)]
    pd_endpoints: Vec<String>,

    /// Data directory for range WALs.
    #[arg(long, default_value = "./data/range-server")]
    data_dir: PathBuf,

    /// Heartbeat interval in milliseconds.
    #[arg(long, default_value_t = 2_000)]
    heartbeat_interval_ms: u64,

    /// Disable fdatasync on WAL appends (tests only).
    #[arg(long, default_value_t = false)]
    no_sync: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = RangeServerConfig {
        node: args.node,
        listen_addr: args.listen,
        advertise_addr: args.advertise,
        pd_endpoints: args.pd_endpoints,
        data_dir: args.data_dir,
        heartbeat_interval_ms: args.heartbeat_interval_ms,
        sync_policy: if args.no_sync {
            SyncPolicy::Never
        } else {
            SyncPolicy::Always
        },
    };

    let server = RangeServer::bind(config).await?;
    let handle = server.start();

    tokio::signal::ctrl_c().await?;
    handle.shutdown().await;
    Ok(())
}
