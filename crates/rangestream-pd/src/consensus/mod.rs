//! Raft-style consensus for the PD metadata log.
//!
//! Three pieces:
//!
//! - [`log::RaftLog`]: the durable command log plus persisted term/vote.
//! - [`core::RaftCore`]: the protocol state machine, written sans-I/O — it
//!   consumes ticks and messages and emits outbound messages, which makes
//!   the election and replication rules directly unit-testable.
//! - [`driver`]: the tokio task that owns the core, exchanges messages with
//!   peers, applies committed commands to [`crate::state::MetaState`], and
//!   resolves proposal waiters.
//!
//! Deliberately omitted, like toydb's raft: snapshots, membership changes,
//! log compaction, pre-vote. A single-node cluster elects itself on the
//! first tick and commits proposals immediately.

pub mod core;
pub mod driver;
pub mod log;

pub use self::core::{Outbound, RaftCore};
pub use self::driver::{spawn, ConsensusHandle, RoleInfo};
pub use self::log::RaftLog;

/// Leader heartbeat interval, in ticks.
pub const HEARTBEAT_TICKS: u32 = 1;

/// Election timeout range, in ticks. Randomized per node to avoid ties.
pub const ELECTION_TIMEOUT_TICKS: std::ops::Range<u32> = 4..8;

/// Maximum entries shipped in a single append.
pub const MAX_APPEND_ENTRIES: usize = 256;
