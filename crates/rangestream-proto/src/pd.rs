//! Placement-driver message set.
//!
//! Covers three callers: end clients (stream lifecycle and leader lookup),
//! range servers (heartbeats and lease renewal), and PD peers (consensus
//! traffic rides the same surface as [`PdRequest::Raft`]).

use rangestream_core::{
    Epoch, LeaderInfo, Lease, NodeDescriptor, NodeId, RangeId, ReplicaProgress, StreamDescriptor,
    StreamId,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PdRequest {
    /// Create a stream with the given replica count; places range 0.
    CreateStream { replica_count: u32 },

    /// Delete a stream and all of its ranges.
    DeleteStream { stream: StreamId },

    /// Describe a stream: ranges in offset order with leaders and epochs.
    DescribeStream { stream: StreamId },

    /// Resolve the current leader of a range.
    GetLeader { range: RangeId },

    /// List registered range-server nodes.
    ListNodes,

    /// Seal the open range of a stream at its committed high watermark and
    /// place the successor range.
    SealRange { range: RangeId },

    /// Renew the caller's leader lease for a range. Denied if a newer epoch
    /// exists; the caller must step down immediately.
    RenewLease {
        range: RangeId,
        node: NodeId,
        progress: ReplicaProgress,
    },

    /// Node liveness heartbeat carrying per-replica progress. The ack
    /// piggybacks topology commands for the sender.
    Heartbeat {
        node: NodeId,
        address: String,
        progress: Vec<ReplicaProgress>,
    },

    /// PD peer-to-peer consensus traffic.
    Raft(RaftRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PdResponse {
    StreamCreated(StreamDescriptor),
    StreamDeleted,
    StreamInfo(StreamDescriptor),
    Leader(LeaderInfo),
    Nodes(Vec<NodeDescriptor>),
    Sealed { range: RangeId, end_offset: u64 },
    Lease(Lease),
    HeartbeatAck { commands: Vec<NodeCommand> },
    Raft(RaftResponse),
}

/// Topology commands piggybacked on heartbeat acks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeCommand {
    /// The receiving node leads this range as of `metadata.epoch`.
    BecomeLeader {
        metadata: rangestream_core::RangeMetadata,
    },

    /// A newer epoch exists; stop accepting writes for the range.
    StepDown { range: RangeId, epoch: Epoch },

    /// The stream was deleted; drop the local replica and its data.
    DropReplica { range: RangeId },
}

/// An entry in the PD replicated command log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    /// Bincode-encoded metadata command; opaque to the consensus layer.
    pub command: Vec<u8>,
}

/// Consensus messages between PD peers. The transport is request/response,
/// so each message carries its reply inline rather than as a separate
/// message in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRequest {
    /// A candidate solicits a vote.
    Vote {
        term: u64,
        candidate: NodeId,
        last_index: u64,
        last_term: u64,
    },

    /// The leader replicates entries (empty for a heartbeat). `base_index`/
    /// `base_term` identify the entry immediately preceding `entries`.
    Append {
        term: u64,
        leader: NodeId,
        base_index: u64,
        base_term: u64,
        entries: Vec<LogEntry>,
        commit_index: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftResponse {
    Vote { term: u64, granted: bool },

    /// `last_index` is the responder's log end; on rejection the leader
    /// resumes probing from there.
    Append {
        term: u64,
        success: bool,
        last_index: u64,
    },
}
