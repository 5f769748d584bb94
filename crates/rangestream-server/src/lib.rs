//! RangeStream range server.
//!
//! A storage node hosting range replicas: durable per-range record logs
//! (WAL-backed), leader appends with quorum replication, offset-based
//! fetch of committed records, and an explicit per-range leadership state
//! machine fenced by PD-issued epochs and leases.
//!
//! ```text
//!             Append/Fetch                Replicate/Seal
//!   clients ───────────────▶ leader ─────────────────────▶ followers
//!                              │
//!                              │ RenewLease / Heartbeat(progress)
//!                              ▼
//!                        placement driver
//! ```
//!
//! Module map:
//! - [`wal`], [`log`]: durability and the in-memory record window
//! - [`replica`]: the per-range role state machine and epoch rules
//! - [`replication`]: fan-out, catch-up, takeover reconciliation
//! - [`lease`], [`heartbeat`]: PD coordination and self-fencing
//! - [`service`], [`server`]: wire dispatch and the TCP server

pub mod config;
pub mod heartbeat;
pub mod lease;
pub mod log;
pub mod peers;
pub mod ranges;
pub mod replica;
pub mod replication;
pub mod server;
pub mod service;
pub mod wal;

pub use config::{RangeServerConfig, SyncPolicy};
pub use server::{BoundRangeServer, RangeServer, RangeServerHandle};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time before Unix epoch")
        .as_millis() as u64
}
