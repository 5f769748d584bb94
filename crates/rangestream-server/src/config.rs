//! Range-server configuration.

use std::path::PathBuf;

use rangestream_core::NodeId;
use serde::{Deserialize, Serialize};

/// Sync policy for range WAL writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// fdatasync after every append before acknowledging. The default:
    /// appends are reported committed only once durable.
    Always,

    /// Never sync (tests only).
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeServerConfig {
    /// This node's id within the range-server cluster.
    pub node: NodeId,

    /// Address to bind to.
    pub listen_addr: String,

    /// Address advertised to the PD (defaults to the bound address).
    #[serde(default)]
    pub advertise_addr: Option<String>,

    /// PD endpoints.
    pub pd_endpoints: Vec<String>,

    /// Directory for range WALs.
    pub data_dir: PathBuf,

    /// Heartbeat interval towards the PD.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// WAL sync policy.
    #[serde(default = "default_sync_policy")]
    pub sync_policy: SyncPolicy,
}

fn default_heartbeat_interval_ms() -> u64 {
    2_000
}

fn default_sync_policy() -> SyncPolicy {
    SyncPolicy::Always
}

impl RangeServerConfig {
    pub fn new(
        node: NodeId,
        listen_addr: impl Into<String>,
        pd_endpoints: Vec<String>,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            node,
            listen_addr: listen_addr.into(),
            advertise_addr: None,
            pd_endpoints,
            data_dir,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            sync_policy: default_sync_policy(),
        }
    }
}
