//! Cluster-wide error taxonomy.
//!
//! Every component speaks the same error vocabulary, and errors travel over
//! the wire verbatim (the enum is serde-encodable; `std::io::Error` is
//! flattened to its message on conversion). The important distinctions:
//!
//! - `StaleEpoch`, `NotLeader`: the caller's view of leadership is outdated;
//!   re-resolve via the placement driver and retry.
//! - `OffsetOutOfRange` vs `DataLoss`: a fetch below the low watermark means
//!   retention truncated data the consumer has not read (`DataLoss`,
//!   terminal); a fetch above the high watermark is a caller bug.
//! - `LeaseDenied`: the local node must cease accepting writes immediately.
//! - `Unavailable`, `NoCapacity`: transient; retry with bounded backoff.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Epoch, NodeId, RangeId, StreamId};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum Error {
    /// Local I/O failure, flattened to a message so the error can cross the
    /// wire.
    #[error("io error: {0}")]
    Io(String),

    /// The caller's epoch is behind the range's current epoch. The caller
    /// must step down (replica) or re-resolve the leader (client).
    #[error("stale epoch: current epoch for the range is {current}")]
    StaleEpoch { current: Epoch },

    #[error("unknown stream {0}")]
    StreamUnknown(StreamId),

    #[error("unknown range {0}")]
    RangeUnknown(RangeId),

    /// Placement failed: fewer healthy nodes than the requested replica
    /// count. Retryable once nodes come back.
    #[error("insufficient healthy nodes: need {needed}, have {healthy}")]
    NoCapacity { needed: usize, healthy: usize },

    /// Fetch offset outside the fetchable window `[low, high)`. Callers
    /// translate `requested < low_watermark` into [`Error::DataLoss`].
    #[error("offset {requested} outside fetchable window [{low_watermark}, {high_watermark})")]
    OffsetOutOfRange {
        requested: u64,
        low_watermark: u64,
        high_watermark: u64,
    },

    /// Retention truncated data the consumer has not read yet. Terminal.
    #[error("data loss: offset {requested} is below the low watermark {low_watermark}")]
    DataLoss { requested: u64, low_watermark: u64 },

    /// Lease renewal denied: a newer epoch exists. The local node must stop
    /// accepting writes for the range immediately.
    #[error("lease denied: range is held at epoch {epoch}")]
    LeaseDenied { epoch: Epoch },

    /// The addressed node does not lead the range. Carries a leader hint
    /// when one is known.
    #[error("not leader for range (leader: {leader:?}, epoch {epoch})")]
    NotLeader {
        leader: Option<NodeId>,
        epoch: Epoch,
    },

    /// Append to a sealed range. The caller must refresh the stream
    /// descriptor and write to the successor range.
    #[error("range sealed at offset {end_offset}")]
    RangeSealed { end_offset: u64 },

    /// Transient unavailability: connection failures, missing quorum, a
    /// placement-driver follower answering for its leader.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a client may retry after backoff (possibly after
    /// re-resolving leadership). Terminal conditions — `DataLoss`,
    /// corruption, protocol violations — are not retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::StaleEpoch { .. }
            | Error::NotLeader { .. }
            | Error::NoCapacity { .. }
            | Error::RangeSealed { .. }
            | Error::Unavailable(_)
            | Error::Io(_) => true,

            Error::StreamUnknown(_)
            | Error::RangeUnknown(_)
            | Error::OffsetOutOfRange { .. }
            | Error::DataLoss { .. }
            | Error::LeaseDenied { .. }
            | Error::Corrupt(_)
            | Error::Protocol(_)
            | Error::Internal(_) => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(Error::StaleEpoch { current: 3 }.is_retryable());
        assert!(Error::Unavailable("connection refused".into()).is_retryable());
        assert!(Error::NoCapacity {
            needed: 3,
            healthy: 1
        }
        .is_retryable());
        assert!(Error::NotLeader {
            leader: Some(2),
            epoch: 4
        }
        .is_retryable());
    }

    #[test]
    fn terminal_errors_are_not_retryable() {
        assert!(!Error::DataLoss {
            requested: 10,
            low_watermark: 100
        }
        .is_retryable());
        assert!(!Error::LeaseDenied { epoch: 5 }.is_retryable());
        assert!(!Error::OffsetOutOfRange {
            requested: 10,
            low_watermark: 0,
            high_watermark: 5
        }
        .is_retryable());
        assert!(!Error::Corrupt("crc mismatch".into()).is_retryable());
    }

    #[test]
    fn io_errors_flatten_to_message() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire").into();
        assert_eq!(err, Error::Io("disk on fire".into()));
    }
}
