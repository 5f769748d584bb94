//! RangeStream placement driver (PD).
//!
//! The PD is the authoritative source of range-to-replica-set mapping and
//! leader-epoch issuance. A PD cluster replicates every metadata mutation —
//! stream creation, lease renewal, heartbeats, failure-detection ticks —
//! through a Raft-style replicated log ([`consensus`]), applying committed
//! commands to a deterministic in-memory state machine ([`state`]).
//!
//! Reads (leader lookup, stream description) are served by the PD leader
//! from applied state.
//!
//! ```text
//! clients / range servers
//!         │  PdRequest
//!         ▼
//! ┌──────────────┐  propose   ┌───────────┐  apply   ┌───────────┐
//! │   PdServer    │ ─────────▶ │ consensus │ ───────▶ │ MetaState │
//! └──────────────┘            └───────────┘          └───────────┘
//!                                  │ Raft append/vote
//!                                  ▼
//!                              PD peers
//! ```

pub mod client;
pub mod config;
pub mod consensus;
pub mod server;
pub mod state;

pub use client::{PdClient, PlacementDriver};
pub use config::{PdConfig, PeerConfig};
pub use server::{BoundPdServer, PdHandle, PdServer};

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Wall-clock readings are taken at the PD leader and carried inside
/// commands, never read during apply, so replicas stay deterministic.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time before Unix epoch")
        .as_millis() as u64
}
