//! Range-server message set.
//!
//! Client-facing operations (`Append`, `Fetch`) and the replication path
//! between range servers (`Replicate`, `SealReplica`).

use rangestream_core::{Epoch, NewRecord, RangeId, RangeMetadata, Record, Watermarks};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RsRequest {
    /// Append a batch to a range. Accepted only if `epoch` matches the
    /// range's current leader epoch and the receiver holds the lease.
    Append {
        range: RangeId,
        epoch: Epoch,
        records: Vec<NewRecord>,
    },

    /// Fetch committed records from `start_offset`, bounded by both a
    /// record count and a byte budget (whichever is hit first; at least one
    /// record is returned when any is available).
    Fetch {
        range: RangeId,
        start_offset: u64,
        max_records: u32,
        max_bytes: u32,
    },

    /// Leader-to-follower replication. Carries the range metadata so a
    /// follower can create the replica on first contact; `metadata.epoch`
    /// fences stale leaders.
    Replicate {
        metadata: RangeMetadata,
        base_offset: u64,
        records: Vec<Record>,
        commit_index: u64,
    },

    /// Fence the replica at `epoch` and report its log end. Issued by a
    /// newly elected leader while reconciling.
    SealReplica { range: RangeId, epoch: Epoch },

    /// Read the raw tail `[from, log_end)` of a fenced replica, committed
    /// or not. A newly elected leader pulls this when a sealed survivor
    /// turns out to hold a longer log (which may contain quorum-committed
    /// records the election could not see).
    ReadTail {
        range: RangeId,
        epoch: Epoch,
        from: u64,
    },

    /// Retention: advance the low watermark, discarding the prefix.
    Truncate { range: RangeId, new_start_offset: u64 },

    /// Report the range's watermarks.
    Watermarks { range: RangeId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RsResponse {
    /// The batch was quorum-committed as offsets `[base_offset, end_offset)`.
    Appended { base_offset: u64, end_offset: u64 },

    /// Fetched records plus the range's watermarks at read time.
    Records {
        records: Vec<Record>,
        watermarks: Watermarks,
    },

    /// Follower state after applying (or refusing) a replicate call. On a
    /// gap the follower leaves its log untouched and reports `log_end` so
    /// the leader can resend from there.
    Replicated { log_end: u64, committed: u64 },

    Sealed { log_end: u64 },

    Tail { records: Vec<Record>, log_end: u64 },

    Truncated { watermarks: Watermarks },

    Watermarks { watermarks: Watermarks },
}
