//! Record types.
//!
//! A [`Record`] is the fundamental unit of data in a stream: an immutable
//! payload plus its assigned offset (monotonic and gapless within a range)
//! and the epoch of the leader term that accepted it.
//!
//! Payloads use `bytes::Bytes` so that fetch responses and replication
//! fan-out can slice batches without copying.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::Epoch;

/// A record as stored in a range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Offset of this record within its stream.
    pub offset: u64,

    /// Epoch of the leader term that accepted the record.
    pub epoch: Epoch,

    /// Append timestamp, milliseconds since the Unix epoch.
    pub timestamp: u64,

    /// Optional key.
    pub key: Option<Bytes>,

    /// Value (payload).
    pub value: Bytes,
}

impl Record {
    pub fn new(offset: u64, epoch: Epoch, timestamp: u64, key: Option<Bytes>, value: Bytes) -> Self {
        Self {
            offset,
            epoch,
            timestamp,
            key,
            value,
        }
    }

    /// Estimate the in-memory size of this record in bytes.
    pub fn estimated_size(&self) -> usize {
        8 + // offset
        8 + // epoch
        8 + // timestamp
        self.key.as_ref().map(|k| k.len()).unwrap_or(0) +
        self.value.len()
    }
}

/// A record payload that has not yet been assigned an offset.
///
/// Producers send these; the range leader assigns offsets, epoch, and
/// timestamp when it accepts the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRecord {
    pub key: Option<Bytes>,
    pub value: Bytes,
}

impl NewRecord {
    pub fn new(key: Option<Bytes>, value: Bytes) -> Self {
        Self { key, value }
    }

    pub fn estimated_size(&self) -> usize {
        self.key.as_ref().map(|k| k.len()).unwrap_or(0) + self.value.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimated_size_counts_key_and_value() {
        let without_key = Record::new(0, 1, 0, None, Bytes::from_static(b"0123456789"));
        assert_eq!(without_key.estimated_size(), 24 + 10);

        let with_key = Record::new(
            0,
            1,
            0,
            Some(Bytes::from_static(b"key")),
            Bytes::from_static(b"0123456789"),
        );
        assert_eq!(with_key.estimated_size(), 24 + 3 + 10);
    }
}
