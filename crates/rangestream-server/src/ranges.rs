//! The set of range replicas hosted by this node.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use rangestream_core::{RangeId, RangeMetadata, ReplicaProgress, Result};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::SyncPolicy;
use crate::replica::Replica;

pub struct Ranges {
    directory: PathBuf,
    sync_policy: SyncPolicy,
    map: RwLock<HashMap<RangeId, Arc<Replica>>>,
}

impl Ranges {
    pub fn new(directory: PathBuf, sync_policy: SyncPolicy) -> Self {
        Self {
            directory,
            sync_policy,
            map: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, range: RangeId) -> Option<Arc<Replica>> {
        self.map.read().await.get(&range).cloned()
    }

    /// Get the replica for a range, opening it (and recovering its WAL) on
    /// first contact. New replicas start as followers at epoch 0; the
    /// caller's epoch checks take it from there.
    pub async fn get_or_open(&self, metadata: &RangeMetadata) -> Result<Arc<Replica>> {
        if let Some(replica) = self.get(metadata.id).await {
            return Ok(replica);
        }

        let mut map = self.map.write().await;
        if let Some(replica) = map.get(&metadata.id) {
            return Ok(replica.clone());
        }
        let replica = Arc::new(
            Replica::open(
                &self.directory,
                metadata.id,
                metadata.start_offset,
                0,
                self.sync_policy,
            )
            .await?,
        );
        info!(range = %metadata.id, start_offset = metadata.start_offset, "replica opened");
        map.insert(metadata.id, replica.clone());
        Ok(replica)
    }

    /// Drop a replica and delete its data (stream deleted).
    pub async fn drop_replica(&self, range: RangeId) {
        let removed = self.map.write().await.remove(&range);
        if removed.is_some() {
            let path = self
                .directory
                .join(format!("{}-{}.wal", range.stream, range.index));
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(%range, error = %e, "failed to delete replica wal");
                }
            }
            info!(%range, "replica dropped");
        }
    }

    /// Progress of every hosted replica, for heartbeats.
    pub async fn progress(&self) -> Vec<ReplicaProgress> {
        let replicas: Vec<Arc<Replica>> = self.map.read().await.values().cloned().collect();
        let mut progress = Vec::with_capacity(replicas.len());
        for replica in replicas {
            progress.push(replica.progress().await);
        }
        progress
    }

    /// Replicas currently in the leader role (for lease renewal).
    pub async fn leaders(&self) -> Vec<Arc<Replica>> {
        let replicas: Vec<Arc<Replica>> = self.map.read().await.values().cloned().collect();
        let mut leaders = Vec::new();
        for replica in replicas {
            if replica.leader_metadata().await.is_some() {
                leaders.push(replica);
            }
        }
        leaders
    }
}
