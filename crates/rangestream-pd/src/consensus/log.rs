//! Durable Raft log and term/vote state.
//!
//! Log file format: a sequence of crc-framed entries,
//!
//! ```text
//! ┌────────────┬───────────┬──────────────────┐
//! │ Len (4 LE) │ CRC32 (4) │ bincode LogEntry │
//! └────────────┴───────────┴──────────────────┘
//! ```
//!
//! Recovery reads the file front to back and truncates at the first torn or
//! corrupt frame — everything before it was synced before being
//! acknowledged. Term and vote live in a separate small file, replaced
//! atomically (tmp + rename) on every change.

use std::path::{Path, PathBuf};

use rangestream_core::{Error, NodeId, Result};
use rangestream_proto::pd::LogEntry;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

const LOG_FILE: &str = "raft.log";
const META_FILE: &str = "raft.meta";

#[derive(Debug, Serialize, Deserialize)]
struct Meta {
    term: u64,
    voted_for: Option<NodeId>,
}

pub struct RaftLog {
    log_path: PathBuf,
    meta_path: PathBuf,
    file: File,
    /// In-memory copy of the whole log; indices are 1-based, so
    /// `entries[i].index == i as u64 + 1`.
    entries: Vec<LogEntry>,
    term: u64,
    voted_for: Option<NodeId>,
}

impl RaftLog {
    pub async fn open(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let log_path = dir.join(LOG_FILE);
        let meta_path = dir.join(META_FILE);

        let (term, voted_for) = match tokio::fs::read(&meta_path).await {
            Ok(buf) => {
                let meta: Meta = decode_framed(&buf)
                    .ok_or_else(|| Error::Corrupt("raft meta file".into()))?;
                (meta.term, meta.voted_for)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (0, None),
            Err(e) => return Err(e.into()),
        };

        let buf = match tokio::fs::read(&log_path).await {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let (entries, valid_len) = parse_log(&buf)?;
        if valid_len < buf.len() {
            warn!(
                valid = valid_len,
                total = buf.len(),
                "torn tail in raft log, truncating"
            );
            tokio::fs::write(&log_path, &buf[..valid_len]).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;

        info!(
            entries = entries.len(),
            term, "raft log opened"
        );

        Ok(Self {
            log_path,
            meta_path,
            file,
            entries,
            term,
            voted_for,
        })
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    /// Persist a new term and vote. The term never regresses.
    pub async fn set_term(&mut self, term: u64, voted_for: Option<NodeId>) -> Result<()> {
        assert!(term >= self.term, "term regression {} -> {}", self.term, term);
        let meta = Meta { term, voted_for };
        let buf = encode_framed(&meta)?;
        let tmp = self.meta_path.with_extension("tmp");
        {
            let mut f = File::create(&tmp).await?;
            f.write_all(&buf).await?;
            f.sync_data().await?;
        }
        tokio::fs::rename(&tmp, &self.meta_path).await?;
        self.term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map_or(0, |e| e.term)
    }

    /// Term of the entry at `index`; index 0 is the empty-log sentinel.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.entries.get(index as usize - 1).map(|e| e.term)
    }

    pub fn has(&self, index: u64, term: u64) -> bool {
        self.term_at(index) == Some(term)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    /// Entries `[from, from + max)` for replication.
    pub fn entries_from(&self, from: u64, max: usize) -> Vec<LogEntry> {
        if from == 0 || from > self.last_index() {
            return Vec::new();
        }
        self.entries[from as usize - 1..]
            .iter()
            .take(max)
            .cloned()
            .collect()
    }

    /// Append contiguous entries and sync them to disk.
    pub async fn append(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut expected = self.last_index() + 1;
        let mut buf = Vec::new();
        for entry in &entries {
            if entry.index != expected {
                return Err(Error::Internal(format!(
                    "non-contiguous raft append: expected {expected}, got {}",
                    entry.index
                )));
            }
            expected += 1;
            buf.extend_from_slice(&encode_framed(entry)?);
        }
        self.file.write_all(&buf).await?;
        self.file.sync_data().await?;
        self.entries.extend(entries);
        Ok(())
    }

    /// Drop entries at `index` and above, rewriting the file.
    pub async fn truncate_from(&mut self, index: u64) -> Result<()> {
        if index > self.last_index() {
            return Ok(());
        }
        self.entries.truncate(index.saturating_sub(1) as usize);

        let mut buf = Vec::new();
        for entry in &self.entries {
            buf.extend_from_slice(&encode_framed(entry)?);
        }
        tokio::fs::write(&self.log_path, &buf).await?;
        self.file = OpenOptions::new()
            .append(true)
            .open(&self.log_path)
            .await?;
        self.file.sync_data().await?;
        Ok(())
    }

    /// Follower-side splice: skip entries already present, truncate on the
    /// first term conflict, append the remainder.
    pub async fn splice(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        let mut to_append = Vec::new();
        for entry in entries {
            match self.term_at(entry.index) {
                Some(term) if term == entry.term && to_append.is_empty() => continue,
                Some(_) if to_append.is_empty() => {
                    self.truncate_from(entry.index).await?;
                    to_append.push(entry);
                }
                _ => to_append.push(entry),
            }
        }
        self.append(to_append).await
    }
}

fn encode_framed<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload =
        bincode::serialize(value).map_err(|e| Error::Internal(format!("encode: {e}")))?;
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

fn decode_framed<T: for<'de> Deserialize<'de>>(buf: &[u8]) -> Option<T> {
    if buf.len() < 8 {
        return None;
    }
    let len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    let crc = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    let payload = buf.get(8..8 + len)?;
    if crc32fast::hash(payload) != crc {
        return None;
    }
    bincode::deserialize(payload).ok()
}

/// Parse all valid frames; returns the entries and the length of the valid
/// prefix.
fn parse_log(buf: &[u8]) -> Result<(Vec<LogEntry>, usize)> {
    let mut entries: Vec<LogEntry> = Vec::new();
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
        let Ok(entry) = bincode::deserialize::<LogEntry>(payload) else {
            break;
        };
        if entry.index != entries.len() as u64 + 1 {
            return Err(Error::Corrupt(format!(
                "raft log index gap: expected {}, found {}",
                entries.len() + 1,
                entry.index
            )));
        }
        entries.push(entry);
        pos += 8 + len;
    }
    Ok((entries, pos))
}
