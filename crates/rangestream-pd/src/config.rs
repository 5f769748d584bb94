//! Placement driver configuration.

use std::path::PathBuf;

use rangestream_core::NodeId;
use serde::{Deserialize, Serialize};

/// A PD peer: another node of the PD cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node: NodeId,
    pub address: String,
}

/// Configuration for one PD node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdConfig {
    /// This node's id within the PD cluster.
    pub node: NodeId,

    /// Address to bind to.
    pub listen_addr: String,

    /// The other PD nodes (this node excluded). Empty for a single-node
    /// cluster.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Directory for the replicated command log.
    pub data_dir: PathBuf,

    /// Leader lease duration granted to range servers.
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,

    /// A range server missing heartbeats for this long is considered dead
    /// and its ranges are re-elected.
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,

    /// Consensus tick interval (election timeouts and leader heartbeats are
    /// multiples of this).
    #[serde(default = "default_raft_tick_ms")]
    pub raft_tick_ms: u64,
}

fn default_lease_ttl_ms() -> u64 {
    10_000
}

fn default_node_timeout_ms() -> u64 {
    5_000
}

fn default_raft_tick_ms() -> u64 {
    100
}

impl PdConfig {
    /// Convenience constructor for a single-node PD.
    pub fn single_node(node: NodeId, listen_addr: impl Into<String>, data_dir: PathBuf) -> Self {
        Self {
            node,
            listen_addr: listen_addr.into(),
            peers: Vec::new(),
            data_dir,
            lease_ttl_ms: default_lease_ttl_ms(),
            node_timeout_ms: default_node_timeout_ms(),
            raft_tick_ms: default_raft_tick_ms(),
        }
    }
}
