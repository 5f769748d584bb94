//! Per-range write-ahead log.
//!
//! One WAL file per hosted range replica, named `{stream}-{index}.wal`.
//! Records are framed with a length prefix and CRC32 checksum:
//!
//! ```text
//! ┌────────────┬───────────┬────────────────┐
//! │ Len (4 LE) │ CRC32 (4) │ bincode Record │
//! └────────────┴───────────┴────────────────┘
//! ```
//!
//! Appends are written and (by default) fdatasync'd before the caller
//! acknowledges anything — a record is never reported durable before it is.
//! Recovery reads the file front to back and truncates at the first torn or
//! corrupt frame. Prefix truncation (retention) and suffix truncation
//! (epoch conflicts on followers) both rewrite the file; they are rare and
//! the in-memory window is the source for the rewrite.

use std::path::{Path, PathBuf};

use rangestream_core::{Error, RangeId, Record, Result};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::SyncPolicy;

pub struct RangeWal {
    range: RangeId,
    path: PathBuf,
    file: File,
    sync: bool,
    size: u64,
}

impl RangeWal {
    /// Open or create the WAL for a range, returning the recovered records.
    pub async fn open(
        directory: &Path,
        range: RangeId,
        sync_policy: SyncPolicy,
    ) -> Result<(Self, Vec<Record>)> {
        tokio::fs::create_dir_all(directory).await?;
        let path = directory.join(format!("{}-{}.wal", range.stream, range.index));

        let buf = match tokio::fs::read(&path).await {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let (records, valid_len) = parse_wal(&buf);
        if valid_len < buf.len() {
            warn!(
                %range,
                valid = valid_len,
                total = buf.len(),
                "torn tail in range wal, truncating"
            );
            tokio::fs::write(&path, &buf[..valid_len]).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        if !records.is_empty() {
            info!(%range, recovered = records.len(), "range wal recovered");
        }

        Ok((
            Self {
                range,
                path,
                file,
                sync: sync_policy == SyncPolicy::Always,
                size: valid_len as u64,
            },
            records,
        ))
    }

    /// Append records durably (single write, single sync).
    pub async fn append(&mut self, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for record in records {
            buf.extend_from_slice(&encode_frame(record)?);
        }
        self.file.write_all(&buf).await?;
        if self.sync {
            self.file.sync_data().await?;
        }
        self.size += buf.len() as u64;

        debug!(range = %self.range, records = records.len(), bytes = buf.len(), "wal append");
        Ok(())
    }

    /// Replace the file contents with `records` (prefix or suffix
    /// truncation).
    pub async fn rewrite(&mut self, records: &[Record]) -> Result<()> {
        let mut buf = Vec::new();
        for record in records {
            buf.extend_from_slice(&encode_frame(record)?);
        }
        tokio::fs::write(&self.path, &buf).await?;
        self.file = OpenOptions::new().append(true).open(&self.path).await?;
        if self.sync {
            self.file.sync_data().await?;
        }
        self.size = buf.len() as u64;

        info!(range = %self.range, records = records.len(), "wal rewritten");
        Ok(())
    }

    /// Delete the WAL file (replica dropped).
    pub async fn delete(self) -> Result<()> {
        tokio::fs::remove_file(&self.path).await?;
        info!(range = %self.range, path = ?self.path, "wal deleted");
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

fn encode_frame(record: &Record) -> Result<Vec<u8>> {
    let payload =
        bincode::serialize(record).map_err(|e| Error::Internal(format!("encode record: {e}")))?;
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Parse all valid frames; returns the records and the valid prefix length.
fn parse_wal(buf: &[u8]) -> (Vec<Record>, usize) {
    let mut records = Vec::new();
    let mut pos = 0;
    while pos + 8 <= buf.len() {
        let len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(buf[pos + 4..pos + 8].try_into().unwrap());
        let Some(payload) = buf.get(pos + 8..pos + 8 + len) else {
            break;
        };
        if crc32fast::hash(payload) != crc {
            break;
        }
        let Ok(record) = bincode::deserialize::<Record>(payload) else {
            break;
        };
        records.push(record);
        pos += 8 + len;
    }
    (records, pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn record(offset: u64, value: &str) -> Record {
        Record::new(offset, 1, 0, None, Bytes::copy_from_slice(value.as_bytes()))
    }

    #[tokio::test]
    async fn append_and_recover() {
        let dir = tempfile::tempdir().unwrap();
        let range = RangeId::new(1, 0);

        {
            let (mut wal, recovered) = RangeWal::open(dir.path(), range, SyncPolicy::Always)
                .await
                .unwrap();
            assert!(recovered.is_empty());
            wal.append(&[record(0, "a"), record(1, "b")]).await.unwrap();
            wal.append(&[record(2, "c")]).await.unwrap();
        }

        let (_, recovered) = RangeWal::open(dir.path(), range, SyncPolicy::Always)
            .await
            .unwrap();
        assert_eq!(recovered.len(), 3);
        assert_eq!(recovered[0].value, Bytes::from("a"));
        assert_eq!(recovered[2].offset, 2);
    }

    #[tokio::test]
    async fn torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let range = RangeId::new(1, 0);

        {
            let (mut wal, _) = RangeWal::open(dir.path(), range, SyncPolicy::Always)
                .await
                .unwrap();
            wal.append(&[record(0, "a"), record(1, "b")]).await.unwrap();
        }

        // Crash mid-write: a partial frame at the tail.
        let path = dir.path().join("1-0.wal");
        let mut contents = std::fs::read(&path).unwrap();
        contents.extend_from_slice(&[42, 0, 0, 0, 1, 2, 3]);
        std::fs::write(&path, &contents).unwrap();

        let (_, recovered) = RangeWal::open(dir.path(), range, SyncPolicy::Always)
            .await
            .unwrap();
        assert_eq!(recovered.len(), 2);

        // The torn bytes were removed from the file as well.
        let reread = std::fs::read(&path).unwrap();
        let (again, valid) = parse_wal(&reread);
        assert_eq!(again.len(), 2);
        assert_eq!(valid, reread.len());
    }

    #[tokio::test]
    async fn corrupt_frame_stops_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let range = RangeId::new(2, 0);

        {
            let (mut wal, _) = RangeWal::open(dir.path(), range, SyncPolicy::Always)
                .await
                .unwrap();
            wal.append(&[record(0, "aaaa"), record(1, "bbbb"), record(2, "cccc")])
                .await
                .unwrap();
        }

        // Flip a byte in the middle of the file.
        let path = dir.path().join("2-0.wal");
        let mut contents = std::fs::read(&path).unwrap();
        let middle = contents.len() / 2;
        contents[middle] ^= 0xff;
        std::fs::write(&path, &contents).unwrap();

        let (_, recovered) = RangeWal::open(dir.path(), range, SyncPolicy::Always)
            .await
            .unwrap();
        assert!(recovered.len() < 3, "corruption must not recover fully");
        for (i, r) in recovered.iter().enumerate() {
            assert_eq!(r.offset, i as u64, "recovered prefix stays ordered");
        }
    }

    #[tokio::test]
    async fn rewrite_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let range = RangeId::new(3, 0);

        let (mut wal, _) = RangeWal::open(dir.path(), range, SyncPolicy::Always)
            .await
            .unwrap();
        wal.append(&[record(0, "a"), record(1, "b"), record(2, "c")])
            .await
            .unwrap();
        wal.rewrite(&[record(1, "b"), record(2, "c")]).await.unwrap();
        wal.append(&[record(3, "d")]).await.unwrap();

        let (_, recovered) = RangeWal::open(dir.path(), range, SyncPolicy::Always)
            .await
            .unwrap();
        assert_eq!(recovered.len(), 3);
        assert_eq!(recovered[0].offset, 1);
        assert_eq!(recovered[2].offset, 3);
    }

    #[tokio::test]
    async fn delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let range = RangeId::new(4, 1);

        let (mut wal, _) = RangeWal::open(dir.path(), range, SyncPolicy::Always)
            .await
            .unwrap();
        wal.append(&[record(0, "a")]).await.unwrap();
        let path = dir.path().join("4-1.wal");
        assert!(path.exists());

        wal.delete().await.unwrap();
        assert!(!path.exists());
    }
}
