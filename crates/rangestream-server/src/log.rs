//! The in-memory record window of a range replica, backed by the WAL.
//!
//! The window holds `[low, log_end)`:
//!
//! ```text
//!   start_offset      low            committed         log_end
//!        │             │                 │                │
//!        ▼             ▼                 ▼                ▼
//!        ├─ truncated ─┼── fetchable ────┼─ uncommitted ──┤
//! ```
//!
//! - `low` is the low watermark: the first retained offset.
//! - `committed` is the high watermark: quorum-replicated; fetch serves
//!   only `[low, committed)`.
//! - `log_end` is the durable log end; `[committed, log_end)` exists but is
//!   never served to fetch.
//!
//! On recovery `committed` starts at `low`: a follower re-learns it from
//! the leader's replicate calls, a leader re-establishes it by
//! re-replicating its tail under its new epoch.

use std::collections::VecDeque;
use std::path::Path;

use rangestream_core::{Epoch, Error, RangeId, Record, Result, Watermarks};

use crate::config::SyncPolicy;
use crate::wal::RangeWal;

pub struct RangeLog {
    range: RangeId,
    low: u64,
    committed: u64,
    records: VecDeque<Record>,
    wal: RangeWal,
}

impl RangeLog {
    pub async fn open(
        directory: &Path,
        range: RangeId,
        start_offset: u64,
        sync_policy: SyncPolicy,
    ) -> Result<Self> {
        let (wal, recovered) = RangeWal::open(directory, range, sync_policy).await?;

        let low = recovered.first().map_or(start_offset, |r| r.offset);
        let mut expected = low;
        for record in &recovered {
            if record.offset != expected {
                return Err(Error::Corrupt(format!(
                    "range {range} wal has an offset gap: expected {expected}, found {}",
                    record.offset
                )));
            }
            expected += 1;
        }

        Ok(Self {
            range,
            low,
            committed: low,
            records: recovered.into(),
            wal,
        })
    }

    pub fn low_watermark(&self) -> u64 {
        self.low
    }

    /// The high watermark: first offset not yet quorum-committed.
    pub fn high_watermark(&self) -> u64 {
        self.committed
    }

    /// One past the last durably stored offset.
    pub fn log_end(&self) -> u64 {
        self.low + self.records.len() as u64
    }

    pub fn watermarks(&self) -> Watermarks {
        Watermarks {
            low: self.low,
            high: self.committed,
        }
    }

    /// Append records durably. Offsets must continue the log exactly.
    pub async fn append(&mut self, records: &[Record]) -> Result<()> {
        let mut expected = self.log_end();
        for record in records {
            if record.offset != expected {
                return Err(Error::Internal(format!(
                    "range {} append out of order: expected {expected}, got {}",
                    self.range, record.offset
                )));
            }
            expected += 1;
        }
        self.wal.append(records).await?;
        self.records.extend(records.iter().cloned());
        Ok(())
    }

    /// Advance the high watermark (never past the log end, never backward).
    pub fn commit_to(&mut self, offset: u64) {
        self.committed = self.committed.max(offset.min(self.log_end()));
    }

    /// Read committed records from `start`, bounded by count and bytes
    /// (whichever is hit first; at least one record when any is available).
    ///
    /// `start == high_watermark` yields an empty batch. Anything outside
    /// `[low, high]` is `OffsetOutOfRange`.
    pub fn read(&self, start: u64, max_records: u32, max_bytes: u32) -> Result<Vec<Record>> {
        if start < self.low || start > self.committed {
            return Err(Error::OffsetOutOfRange {
                requested: start,
                low_watermark: self.low,
                high_watermark: self.committed,
            });
        }
        if start == self.committed {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let mut bytes = 0usize;
        for record in self
            .records
            .iter()
            .skip((start - self.low) as usize)
            .take_while(|r| r.offset < self.committed)
        {
            if !out.is_empty()
                && (out.len() >= max_records as usize
                    || bytes + record.estimated_size() > max_bytes as usize)
            {
                break;
            }
            bytes += record.estimated_size();
            out.push(record.clone());
            if out.len() >= max_records as usize {
                break;
            }
        }
        Ok(out)
    }

    /// Records `[start, end)` regardless of the high watermark, for
    /// replication fan-out and catch-up.
    pub fn slice(&self, start: u64, end: u64) -> Vec<Record> {
        let end = end.min(self.log_end());
        if start < self.low || start >= end {
            return Vec::new();
        }
        self.records
            .iter()
            .skip((start - self.low) as usize)
            .take((end - start) as usize)
            .cloned()
            .collect()
    }

    /// Epoch of the record at `offset`, if present.
    pub fn epoch_at(&self, offset: u64) -> Option<Epoch> {
        if offset < self.low || offset >= self.log_end() {
            return None;
        }
        self.records
            .get((offset - self.low) as usize)
            .map(|r| r.epoch)
    }

    /// Retention: drop `[low, new_low)`. Clamped to the committed window —
    /// uncommitted records are never truncated away.
    pub async fn truncate_prefix(&mut self, new_low: u64) -> Result<()> {
        let new_low = new_low.clamp(self.low, self.committed);
        if new_low == self.low {
            return Ok(());
        }
        let dropped = (new_low - self.low) as usize;
        self.records.drain(..dropped);
        self.low = new_low;

        let remaining: Vec<Record> = self.records.iter().cloned().collect();
        self.wal.rewrite(&remaining).await
    }

    /// Suffix truncation for epoch conflicts: drop `[offset, log_end)`.
    /// Refuses to cut below the high watermark — committed records are
    /// never removed.
    pub async fn truncate_from(&mut self, offset: u64) -> Result<()> {
        if offset < self.committed {
            return Err(Error::Corrupt(format!(
                "range {} asked to truncate committed suffix at {offset} (high watermark {})",
                self.range, self.committed
            )));
        }
        if offset >= self.log_end() {
            return Ok(());
        }
        self.records.truncate((offset - self.low) as usize);

        let remaining: Vec<Record> = self.records.iter().cloned().collect();
        self.wal.rewrite(&remaining).await
    }
}
