//! Leader leases: acquire-on-demand, periodic renewal, self-fencing.
//!
//! A range server never assumes leadership — it asks the PD. The first
//! append (or fetch) for a range this node is supposed to lead triggers a
//! lease acquisition; from then on a background loop renews every lease
//! well inside its TTL. A renewal denied with a newer epoch steps the
//! replica down immediately; a renewal that cannot reach the PD does
//! nothing and the locally tracked expiry fences the replica by itself.

use std::sync::Arc;
use std::time::Duration;

use rangestream_core::{Epoch, Error, NodeId, RangeId, RangeMetadata, ReplicaProgress, Result};
use rangestream_pd::PlacementDriver;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::ranges::Ranges;
use crate::replication::Replicator;

pub struct LeaseKeeper {
    node: NodeId,
    pd: Arc<dyn PlacementDriver>,
    ranges: Arc<Ranges>,
    replicator: Arc<Replicator>,
}

impl LeaseKeeper {
    pub fn new(
        node: NodeId,
        pd: Arc<dyn PlacementDriver>,
        ranges: Arc<Ranges>,
        replicator: Arc<Replicator>,
    ) -> Self {
        Self {
            node,
            pd,
            ranges,
            replicator,
        }
    }

    /// Ensure this node leads `range` with a valid lease, acquiring one
    /// from the PD when the cached lease is missing or expired.
    pub async fn ensure_leader(&self, range: RangeId) -> Result<(Epoch, RangeMetadata)> {
        if let Some(replica) = self.ranges.get(range).await {
            if replica.is_serving_leader().await {
                if let Some(metadata) = replica.leader_metadata().await {
                    return Ok((metadata.epoch, metadata));
                }
            }
        }
        self.acquire(range).await
    }

    async fn acquire(&self, range: RangeId) -> Result<(Epoch, RangeMetadata)> {
        let progress = match self.ranges.get(range).await {
            Some(replica) => replica.progress().await,
            None => ReplicaProgress {
                range,
                log_end: 0,
                committed: 0,
            },
        };

        let lease = match self.pd.renew_lease(range, self.node, progress).await {
            Ok(lease) => lease,
            Err(Error::LeaseDenied { epoch }) => {
                // We do not lead this range (any more). Fence locally and
                // redirect the caller.
                if let Some(replica) = self.ranges.get(range).await {
                    replica.step_down(epoch).await;
                }
                debug!(%range, epoch, "lease denied");
                return Err(Error::NotLeader {
                    leader: None,
                    epoch,
                });
            }
            Err(e) => return Err(e),
        };

        let metadata = lease.metadata.clone();
        if metadata.leader != self.node {
            return Err(Error::NotLeader {
                leader: Some(metadata.leader),
                epoch: metadata.epoch,
            });
        }

        let replica = self.ranges.get_or_open(&metadata).await?;
        let lease_until = Instant::now() + Duration::from_millis(lease.ttl_ms);
        let newly_promoted = replica.promote(metadata.clone(), lease_until).await;
        if newly_promoted {
            // Re-establish the high watermark under the new epoch in the
            // background; fetch serves the old committed window meanwhile.
            let replicator = self.replicator.clone();
            let replica = replica.clone();
            let reconcile_meta = metadata.clone();
            tokio::spawn(async move {
                replicator.reconcile(replica, reconcile_meta).await;
            });
        }

        Ok((metadata.epoch, metadata))
    }

    /// Renew every held lease once.
    pub async fn renew_all(&self) {
        for replica in self.ranges.leaders().await {
            let Some(metadata) = replica.leader_metadata().await else {
                continue;
            };
            let progress = replica.progress().await;
            match self
                .pd
                .renew_lease(metadata.id, self.node, progress)
                .await
            {
                Ok(lease) => {
                    let lease_until = Instant::now() + Duration::from_millis(lease.ttl_ms);
                    replica.extend_lease(lease.metadata, lease_until).await;
                }
                Err(Error::LeaseDenied { epoch }) => {
                    info!(range = %metadata.id, epoch, "deposed, stepping down");
                    replica.step_down(epoch).await;
                }
                // Unreachable PD: do nothing — the local expiry fences us.
                Err(e) => {
                    warn!(range = %metadata.id, error = %e, "lease renewal failed");
                }
            }
        }
    }

    /// Renewal loop, run as a background task.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(node = self.node, interval_ms = interval.as_millis() as u64, "lease renewal started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
            self.renew_all().await;
        }
        info!(node = self.node, "lease renewal stopped");
    }
}
