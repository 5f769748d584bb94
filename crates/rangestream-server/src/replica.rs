//! A hosted range replica and its leadership state machine.
//!
//! Per-range state transitions are explicit:
//!
//! ```text
//!            lease granted (promote)
//!   Follower ─────────────────────────▶ Leader
//!      ▲                                  │
//!      └──────────────────────────────────┘
//!        lease denied / newer epoch seen (step_down)
//! ```
//!
//! Epoch rules, which every entry point enforces:
//! - an append is accepted only when the caller's epoch equals the leader
//!   epoch and the local lease is unexpired (self-fencing);
//! - any message carrying a newer epoch demotes a leader on the spot;
//! - any message carrying an older epoch is answered `StaleEpoch`.
//!
//! Appends for a range are serialized by the `append_lock`, held across
//! replication fan-out; fetches only take the brief inner lock and so run
//! concurrently with in-flight appends, observing committed records only.

use std::path::Path;

use rangestream_core::{
    Epoch, Error, RangeId, RangeMetadata, Record, ReplicaProgress, Result, Watermarks,
};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SyncPolicy;
use crate::log::RangeLog;

pub enum Role {
    Follower {
        epoch: Epoch,
    },
    Leader {
        metadata: RangeMetadata,
        lease_until: Instant,
    },
}

pub struct ReplicaInner {
    pub role: Role,
    pub log: RangeLog,
    /// Metadata last seen from any source; leader hint for redirects.
    pub last_metadata: Option<RangeMetadata>,
}

pub struct Replica {
    pub id: RangeId,
    inner: Mutex<ReplicaInner>,
    /// Serializes the append path (offset assignment through fan-out).
    append_lock: Mutex<()>,
}

impl Replica {
    /// Open a replica as a follower, recovering its log from disk.
    pub async fn open(
        directory: &Path,
        range: RangeId,
        start_offset: u64,
        epoch: Epoch,
        sync_policy: SyncPolicy,
    ) -> Result<Self> {
        let log = RangeLog::open(directory, range, start_offset, sync_policy).await?;
        Ok(Self {
            id: range,
            inner: Mutex::new(ReplicaInner {
                role: Role::Follower { epoch },
                log,
                last_metadata: None,
            }),
            append_lock: Mutex::new(()),
        })
    }

    pub async fn lock_append(&self) -> MutexGuard<'_, ()> {
        self.append_lock.lock().await
    }

    /// Promote to leader under `metadata` with a lease until `lease_until`.
    /// Returns true when this was an actual transition (new leadership or a
    /// newer epoch), i.e. when the caller must reconcile the tail.
    pub async fn promote(&self, metadata: RangeMetadata, lease_until: Instant) -> bool {
        let mut inner = self.inner.lock().await;
        let newly = match &inner.role {
            Role::Leader {
                metadata: current, ..
            } => current.epoch < metadata.epoch,
            Role::Follower { .. } => true,
        };
        if newly {
            info!(range = %self.id, epoch = metadata.epoch, "replica promoted to leader");
        }
        inner.last_metadata = Some(metadata.clone());
        inner.role = Role::Leader {
            metadata,
            lease_until,
        };
        newly
    }

    /// Extend the leader lease after a successful renewal.
    pub async fn extend_lease(&self, metadata: RangeMetadata, lease_until: Instant) {
        let mut inner = self.inner.lock().await;
        inner.last_metadata = Some(metadata.clone());
        if let Role::Leader { .. } = inner.role {
            inner.role = Role::Leader {
                metadata,
                lease_until,
            };
        }
    }

    /// Step down to follower at `epoch` (lease denied, newer epoch seen, or
    /// local lease expiry).
    pub async fn step_down(&self, epoch: Epoch) {
        let mut inner = self.inner.lock().await;
        if let Role::Leader { metadata, .. } = &inner.role {
            if metadata.epoch <= epoch {
                warn!(range = %self.id, epoch, "replica stepping down");
                inner.role = Role::Follower { epoch };
            }
        }
    }

    /// Whether this replica is leader with an unexpired lease.
    pub async fn is_serving_leader(&self) -> bool {
        let inner = self.inner.lock().await;
        match &inner.role {
            Role::Leader { lease_until, .. } => *lease_until > Instant::now(),
            Role::Follower { .. } => false,
        }
    }

    pub async fn current_epoch(&self) -> Epoch {
        let inner = self.inner.lock().await;
        match &inner.role {
            Role::Leader { metadata, .. } => metadata.epoch,
            Role::Follower { epoch } => *epoch,
        }
    }

    /// Leader-side offset assignment and durable append. Returns the
    /// assigned base offset, the stamped records, the replica-set metadata
    /// for fan-out, and the current high watermark.
    pub async fn assign_and_append(
        &self,
        caller_epoch: Epoch,
        payloads: Vec<rangestream_core::NewRecord>,
        timestamp: u64,
    ) -> Result<(u64, Vec<Record>, RangeMetadata, u64)> {
        let mut inner = self.inner.lock().await;

        let metadata = match &inner.role {
            Role::Follower { epoch } => {
                return Err(Error::NotLeader {
                    leader: inner.last_metadata.as_ref().map(|m| m.leader),
                    epoch: *epoch,
                })
            }
            Role::Leader {
                metadata,
                lease_until,
            } => {
                // Self-fencing: a lease that expired locally stops writes
                // even before the PD tells anyone.
                if *lease_until <= Instant::now() {
                    return Err(Error::NotLeader {
                        leader: None,
                        epoch: metadata.epoch,
                    });
                }
                metadata.clone()
            }
        };

        if caller_epoch != metadata.epoch {
            return Err(Error::StaleEpoch {
                current: metadata.epoch,
            });
        }
        if let Some(end_offset) = metadata.end_offset {
            return Err(Error::RangeSealed { end_offset });
        }

        let base = inner.log.log_end();
        let records: Vec<Record> = payloads
            .into_iter()
            .enumerate()
            .map(|(i, p)| Record::new(base + i as u64, metadata.epoch, timestamp, p.key, p.value))
            .collect();
        inner.log.append(&records).await?;

        let committed = inner.log.high_watermark();
        Ok((base, records, metadata, committed))
    }

    pub async fn commit_to(&self, offset: u64) {
        let mut inner = self.inner.lock().await;
        inner.log.commit_to(offset);
    }

    /// Follower-side replication apply.
    ///
    /// - a newer epoch demotes and is adopted; an older one is rejected;
    /// - a gap leaves the log untouched (the response's log end tells the
    ///   leader where to resend from);
    /// - an overlap is skipped record by record unless the stored epoch
    ///   differs, in which case the uncommitted suffix is truncated and
    ///   replaced (the divergent tail of a deposed leader).
    pub async fn apply_replicate(
        &self,
        metadata: &RangeMetadata,
        base_offset: u64,
        records: Vec<Record>,
        commit_index: u64,
    ) -> Result<(u64, u64)> {
        let mut inner = self.inner.lock().await;

        let local_epoch = match &inner.role {
            Role::Leader { metadata: m, .. } => m.epoch,
            Role::Follower { epoch } => *epoch,
        };
        if metadata.epoch < local_epoch {
            return Err(Error::StaleEpoch {
                current: local_epoch,
            });
        }
        if metadata.epoch > local_epoch {
            if matches!(inner.role, Role::Leader { .. }) {
                warn!(range = %self.id, epoch = metadata.epoch, "deposed by newer epoch");
            }
            inner.role = Role::Follower {
                epoch: metadata.epoch,
            };
        }
        inner.last_metadata = Some(metadata.clone());

        let log_end = inner.log.log_end();
        if base_offset > log_end {
            debug!(
                range = %self.id,
                base_offset,
                log_end,
                "replicate gap, requesting resend"
            );
        } else {
            let mut pending: Option<Vec<Record>> = None;
            for record in records {
                match pending.as_mut() {
                    Some(batch) => batch.push(record),
                    None => {
                        match inner.log.epoch_at(record.offset) {
                            // Already stored under the same epoch: skip.
                            Some(epoch) if epoch == record.epoch => {}
                            // Divergent uncommitted suffix: replace it.
                            Some(_) => {
                                inner.log.truncate_from(record.offset).await?;
                                pending = Some(vec![record]);
                            }
                            None => pending = Some(vec![record]),
                        }
                    }
                }
            }
            if let Some(batch) = pending {
                inner.log.append(&batch).await?;
            }
        }

        inner.log.commit_to(commit_index);
        Ok((inner.log.log_end(), inner.log.high_watermark()))
    }

    /// Fence the replica at `epoch` and report the log end (issued by a
    /// newly elected leader before reconciling).
    pub async fn seal(&self, epoch: Epoch) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let local_epoch = match &inner.role {
            Role::Leader { metadata, .. } => metadata.epoch,
            Role::Follower { epoch } => *epoch,
        };
        if epoch < local_epoch {
            return Err(Error::StaleEpoch {
                current: local_epoch,
            });
        }
        inner.role = Role::Follower { epoch };
        Ok(inner.log.log_end())
    }

    /// Raw tail read `[from, log_end)` for takeover adoption. The caller's
    /// epoch must be current (the replica was just sealed at it).
    pub async fn read_tail(&self, epoch: Epoch, from: u64) -> Result<(Vec<Record>, u64)> {
        let inner = self.inner.lock().await;
        let local_epoch = match &inner.role {
            Role::Leader { metadata, .. } => metadata.epoch,
            Role::Follower { epoch } => *epoch,
        };
        if epoch < local_epoch {
            return Err(Error::StaleEpoch {
                current: local_epoch,
            });
        }
        let log_end = inner.log.log_end();
        Ok((inner.log.slice(from, log_end), log_end))
    }

    /// Adopt a tail pulled from a longer-logged survivor during takeover.
    /// Records keep their original epoch stamps; offsets must continue the
    /// local log exactly.
    pub async fn adopt_tail(&self, records: &[Record]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.role, Role::Leader { .. }) {
            return Err(Error::Internal(
                "tail adoption outside the leader role".into(),
            ));
        }
        inner.log.append(records).await
    }

    /// Leader-only fetch of committed records.
    pub async fn fetch(
        &self,
        start_offset: u64,
        max_records: u32,
        max_bytes: u32,
    ) -> Result<(Vec<Record>, Watermarks)> {
        let inner = self.inner.lock().await;
        match &inner.role {
            Role::Leader { lease_until, .. } if *lease_until > Instant::now() => {
                let records = inner.log.read(start_offset, max_records, max_bytes)?;
                Ok((records, inner.log.watermarks()))
            }
            Role::Leader { metadata, .. } => Err(Error::NotLeader {
                leader: None,
                epoch: metadata.epoch,
            }),
            Role::Follower { epoch } => Err(Error::NotLeader {
                leader: inner.last_metadata.as_ref().map(|m| m.leader),
                epoch: *epoch,
            }),
        }
    }

    pub async fn truncate_prefix(&self, new_low: u64) -> Result<Watermarks> {
        let mut inner = self.inner.lock().await;
        inner.log.truncate_prefix(new_low).await?;
        Ok(inner.log.watermarks())
    }

    pub async fn watermarks(&self) -> Watermarks {
        self.inner.lock().await.log.watermarks()
    }

    pub async fn progress(&self) -> ReplicaProgress {
        let inner = self.inner.lock().await;
        ReplicaProgress {
            range: self.id,
            log_end: inner.log.log_end(),
            committed: inner.log.high_watermark(),
        }
    }

    /// Records `[start, end)` for replication catch-up.
    pub async fn slice(&self, start: u64, end: u64) -> Vec<Record> {
        self.inner.lock().await.log.slice(start, end)
    }

    /// The uncommitted tail `[committed, log_end)`.
    pub async fn tail(&self) -> (u64, u64, Vec<Record>) {
        let inner = self.inner.lock().await;
        let committed = inner.log.high_watermark();
        let log_end = inner.log.log_end();
        (committed, log_end, inner.log.slice(committed, log_end))
    }

    /// Current metadata when in the leader role.
    pub async fn leader_metadata(&self) -> Option<RangeMetadata> {
        match &self.inner.lock().await.role {
            Role::Leader { metadata, .. } => Some(metadata.clone()),
            Role::Follower { .. } => None,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rangestream_core::NodeId;
    use std::time::Duration;

    fn metadata(range: RangeId, epoch: Epoch, leader: NodeId, replicas: Vec<NodeId>) -> RangeMetadata {
        RangeMetadata {
            id: range,
            start_offset: 0,
            end_offset: None,
            epoch,
            leader,
            replicas,
        }
    }

    fn payloads(n: usize) -> Vec<rangestream_core::NewRecord> {
        (0..n)
            .map(|i| rangestream_core::NewRecord::new(None, Bytes::from(format!("r{i}"))))
            .collect()
    }

    fn lease() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    async fn leader_replica(dir: &Path, epoch: Epoch) -> Replica {
        let range = RangeId::new(1, 0);
        let replica = Replica::open(dir, range, 0, epoch, SyncPolicy::Always)
            .await
            .unwrap();
        replica
            .promote(metadata(range, epoch, 0, vec![0, 1, 2]), lease())
            .await;
        replica
    }

    #[tokio::test]
    async fn append_requires_matching_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let replica = leader_replica(dir.path(), 3).await;

        let err = replica
            .assign_and_append(2, payloads(1), 0)
            .await
            .unwrap_err();
        assert_eq!(err, Error::StaleEpoch { current: 3 });

        let (base, records, _, _) = replica.assign_and_append(3, payloads(2), 0).await.unwrap();
        assert_eq!(base, 0);
        assert_eq!(records[1].offset, 1);
        assert_eq!(records[1].epoch, 3);
    }

    #[tokio::test]
    async fn follower_rejects_appends_with_leader_hint() {
        let dir = tempfile::tempdir().unwrap();
        let range = RangeId::new(1, 0);
        let replica = Replica::open(dir.path(), range, 0, 1, SyncPolicy::Always)
            .await
            .unwrap();
        replica
            .apply_replicate(&metadata(range, 1, 7, vec![7, 8]), 0, vec![], 0)
            .await
            .unwrap();

        let err = replica
            .assign_and_append(1, payloads(1), 0)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Error::NotLeader {
                leader: Some(7),
                epoch: 1
            }
        );
    }

    #[tokio::test]
    async fn expired_lease_fences_appends_and_fetches() {
        let dir = tempfile::tempdir().unwrap();
        let range = RangeId::new(1, 0);
        let replica = Replica::open(dir.path(), range, 0, 1, SyncPolicy::Always)
            .await
            .unwrap();
        replica
            .promote(
                metadata(range, 1, 0, vec![0]),
                Instant::now() - Duration::from_millis(1),
            )
            .await;

        assert!(matches!(
            replica.assign_and_append(1, payloads(1), 0).await,
            Err(Error::NotLeader { .. })
        ));
        assert!(matches!(
            replica.fetch(0, 10, 1 << 20).await,
            Err(Error::NotLeader { .. })
        ));
    }

    #[tokio::test]
    async fn replicate_applies_in_order_and_reports_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let range = RangeId::new(2, 0);
        let replica = Replica::open(dir.path(), range, 0, 1, SyncPolicy::Always)
            .await
            .unwrap();
        let meta = metadata(range, 1, 0, vec![0, 1]);

        let batch: Vec<Record> = (0..3)
            .map(|i| Record::new(i, 1, 0, None, Bytes::from(format!("v{i}"))))
            .collect();
        let (log_end, committed) = replica
            .apply_replicate(&meta, 0, batch.clone(), 0)
            .await
            .unwrap();
        assert_eq!((log_end, committed), (3, 0));

        // A gap: base offset beyond the log end leaves the log unchanged.
        let gap: Vec<Record> = (5..7)
            .map(|i| Record::new(i, 1, 0, None, Bytes::from("x")))
            .collect();
        let (log_end, _) = replica.apply_replicate(&meta, 5, gap, 0).await.unwrap();
        assert_eq!(log_end, 3);

        // A duplicate prefix is idempotent, and the commit index applies.
        let (log_end, committed) = replica
            .apply_replicate(&meta, 0, batch, 3)
            .await
            .unwrap();
        assert_eq!((log_end, committed), (3, 3));
    }

    #[tokio::test]
    async fn replicate_with_newer_epoch_deposes_leader() {
        let dir = tempfile::tempdir().unwrap();
        let replica = leader_replica(dir.path(), 1).await;
        replica.assign_and_append(1, payloads(2), 0).await.unwrap();

        let newer = metadata(RangeId::new(1, 0), 2, 1, vec![1, 0]);
        let records = vec![Record::new(2, 2, 0, None, Bytes::from("n"))];
        let (log_end, _) = replica
            .apply_replicate(&newer, 2, records, 2)
            .await
            .unwrap();
        assert_eq!(log_end, 3);
        assert_eq!(replica.current_epoch().await, 2);
        assert!(!replica.is_serving_leader().await);

        // And the deposed epoch can no longer replicate here.
        let stale = metadata(RangeId::new(1, 0), 1, 0, vec![0, 1]);
        let err = replica
            .apply_replicate(&stale, 3, vec![], 0)
            .await
            .unwrap_err();
        assert_eq!(err, Error::StaleEpoch { current: 2 });
    }

    #[tokio::test]
    async fn divergent_uncommitted_suffix_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let range = RangeId::new(3, 0);
        let replica = Replica::open(dir.path(), range, 0, 1, SyncPolicy::Always)
            .await
            .unwrap();

        // Old leader replicated 0..3 at epoch 1, committed up to 2.
        let old = metadata(range, 1, 0, vec![0, 1]);
        let records: Vec<Record> = (0..3)
            .map(|i| Record::new(i, 1, 0, None, Bytes::from(format!("old{i}"))))
            .collect();
        replica
            .apply_replicate(&old, 0, records, 2)
            .await
            .unwrap();

        // New leader at epoch 2 rewrites offset 2 and extends.
        let new = metadata(range, 2, 1, vec![1, 0]);
        let records = vec![
            Record::new(2, 2, 0, None, Bytes::from("new2")),
            Record::new(3, 2, 0, None, Bytes::from("new3")),
        ];
        let (log_end, committed) = replica
            .apply_replicate(&new, 2, records, 4)
            .await
            .unwrap();
        assert_eq!((log_end, committed), (4, 4));

        let (records, _) = {
            // Promote so fetch is allowed.
            replica.promote(new.clone(), lease()).await;
            replica.fetch(2, 10, 1 << 20).await.unwrap()
        };
        assert_eq!(records[0].value, Bytes::from("new2"));
        assert_eq!(records[1].value, Bytes::from("new3"));
    }

    #[tokio::test]
    async fn seal_fences_and_reports_log_end() {
        let dir = tempfile::tempdir().unwrap();
        let replica = leader_replica(dir.path(), 1).await;
        replica.assign_and_append(1, payloads(4), 0).await.unwrap();

        let log_end = replica.seal(2).await.unwrap();
        assert_eq!(log_end, 4);
        assert!(!replica.is_serving_leader().await);

        // Sealing with an older epoch is refused.
        assert_eq!(
            replica.seal(1).await.unwrap_err(),
            Error::StaleEpoch { current: 2 }
        );
    }

    #[tokio::test]
    async fn sealed_range_rejects_appends() {
        let dir = tempfile::tempdir().unwrap();
        let range = RangeId::new(4, 0);
        let replica = Replica::open(dir.path(), range, 0, 1, SyncPolicy::Always)
            .await
            .unwrap();
        let mut meta = metadata(range, 1, 0, vec![0]);
        meta.end_offset = Some(0);
        replica.promote(meta, lease()).await;

        assert_eq!(
            replica.assign_and_append(1, payloads(1), 0).await.unwrap_err(),
            Error::RangeSealed { end_offset: 0 }
        );
    }
}
