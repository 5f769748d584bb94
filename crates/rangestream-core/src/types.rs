//! Identifiers and placement metadata.
//!
//! These types describe the cluster's placement model: which ranges make up
//! a stream, which nodes replicate a range, and who currently leads it.
//! They are produced by the placement driver and travel over the wire, so
//! everything here is `Serialize`/`Deserialize`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stream identifier, allocated by the placement driver.
pub type StreamId = u64;

/// Node identifier. Placement-driver nodes and range-server nodes use
/// separate id spaces; an id is only meaningful within its cluster.
pub type NodeId = u32;

/// Leader epoch for a range. Strictly increasing; a replica may only accept
/// appends while holding the current epoch's lease.
pub type Epoch = u64;

/// Identifies a range: the `index`-th range of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RangeId {
    pub stream: StreamId,
    pub index: u32,
}

impl RangeId {
    pub fn new(stream: StreamId, index: u32) -> Self {
        Self { stream, index }
    }
}

impl fmt::Display for RangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stream, self.index)
    }
}

/// Placement-driver-owned description of a range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeMetadata {
    pub id: RangeId,

    /// First offset of the range (inclusive).
    pub start_offset: u64,

    /// End offset (exclusive) once the range is sealed. `None` while the
    /// range is open and writable.
    pub end_offset: Option<u64>,

    /// Current leader epoch.
    pub epoch: Epoch,

    /// Current leader. Appends go here; so do fetches (leader-only reads).
    pub leader: NodeId,

    /// Replica set, leader included. Order is the placement order.
    pub replicas: Vec<NodeId>,
}

impl RangeMetadata {
    pub fn is_sealed(&self) -> bool {
        self.end_offset.is_some()
    }

    /// Majority quorum size for the replica set (leader included).
    pub fn quorum(&self) -> usize {
        self.replicas.len() / 2 + 1
    }

    /// Whether `offset` falls inside this range.
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start_offset && self.end_offset.map_or(true, |end| offset < end)
    }
}

/// Full description of a stream: its ranges in offset order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub stream: StreamId,
    pub replica_count: u32,
    pub ranges: Vec<RangeMetadata>,
}

impl StreamDescriptor {
    /// The open (writable) range, if any. Invariant: only the last range of
    /// a stream can be open.
    pub fn open_range(&self) -> Option<&RangeMetadata> {
        self.ranges.last().filter(|r| !r.is_sealed())
    }

    /// The range containing `offset`, if any.
    pub fn range_for(&self, offset: u64) -> Option<&RangeMetadata> {
        self.ranges.iter().find(|r| r.contains(offset))
    }
}

/// A registered node as seen by the placement driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node: NodeId,
    pub address: String,
    pub alive: bool,
}

/// Per-replica progress, reported to the placement driver on every
/// heartbeat and lease renewal. Drives failover elections: the replica with
/// the most advanced `log_end` becomes the new leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaProgress {
    pub range: RangeId,

    /// Offset one past the last durably stored record.
    pub log_end: u64,

    /// Offset one past the last quorum-committed record (high watermark).
    pub committed: u64,
}

/// Resolved leader for a range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderInfo {
    pub node: NodeId,
    pub address: String,
    pub epoch: Epoch,
}

/// A granted lease: the caller leads `metadata.id` at `metadata.epoch` for
/// the next `ttl_ms` milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub metadata: RangeMetadata,
    pub ttl_ms: u64,
}

/// The fetchable window of a range: `[low, high)`.
///
/// `low` is the first retained offset (records below it were truncated by
/// retention). `high` is the high watermark: the first offset that is not
/// yet quorum-committed. Fetch never serves at or above `high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    pub low: u64,
    pub high: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u64, end: Option<u64>) -> RangeMetadata {
        RangeMetadata {
            id: RangeId::new(1, 0),
            start_offset: start,
            end_offset: end,
            epoch: 1,
            leader: 0,
            replicas: vec![0, 1, 2],
        }
    }

    #[test]
    fn quorum_is_majority() {
        let mut r = range(0, None);
        r.replicas = vec![0];
        assert_eq!(r.quorum(), 1);
        r.replicas = vec![0, 1];
        assert_eq!(r.quorum(), 2);
        r.replicas = vec![0, 1, 2];
        assert_eq!(r.quorum(), 2);
        r.replicas = vec![0, 1, 2, 3, 4];
        assert_eq!(r.quorum(), 3);
    }

    #[test]
    fn open_range_contains_everything_past_start() {
        let r = range(100, None);
        assert!(!r.contains(99));
        assert!(r.contains(100));
        assert!(r.contains(u64::MAX));
    }

    #[test]
    fn sealed_range_excludes_end() {
        let r = range(100, Some(200));
        assert!(r.contains(100));
        assert!(r.contains(199));
        assert!(!r.contains(200));
    }

    #[test]
    fn descriptor_range_lookup() {
        let sealed = RangeMetadata {
            id: RangeId::new(7, 0),
            start_offset: 0,
            end_offset: Some(50),
            epoch: 2,
            leader: 1,
            replicas: vec![1, 2],
        };
        let open = RangeMetadata {
            id: RangeId::new(7, 1),
            start_offset: 50,
            end_offset: None,
            epoch: 3,
            leader: 2,
            replicas: vec![2, 1],
        };
        let desc = StreamDescriptor {
            stream: 7,
            replica_count: 2,
            ranges: vec![sealed.clone(), open.clone()],
        };
        assert_eq!(desc.range_for(0), Some(&sealed));
        assert_eq!(desc.range_for(49), Some(&sealed));
        assert_eq!(desc.range_for(50), Some(&open));
        assert_eq!(desc.open_range(), Some(&open));
    }
}
