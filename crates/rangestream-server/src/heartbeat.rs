//! Node liveness heartbeat towards the PD.
//!
//! Every interval the node reports its address and per-replica progress,
//! and applies whatever topology commands the PD piggybacks on the ack:
//! leaderships to take up, step-downs after failover, replicas to drop
//! after stream deletion. The first heartbeat fires immediately so a fresh
//! node registers before any placement decision needs it.

use std::sync::Arc;
use std::time::Duration;

use rangestream_core::NodeId;
use rangestream_pd::PlacementDriver;
use rangestream_proto::pd::NodeCommand;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::lease::LeaseKeeper;
use crate::ranges::Ranges;

pub struct HeartbeatTask {
    node: NodeId,
    address: String,
    interval: Duration,
    pd: Arc<dyn PlacementDriver>,
    ranges: Arc<Ranges>,
    lease: Arc<LeaseKeeper>,
}

impl HeartbeatTask {
    pub fn new(
        node: NodeId,
        address: String,
        interval: Duration,
        pd: Arc<dyn PlacementDriver>,
        ranges: Arc<Ranges>,
        lease: Arc<LeaseKeeper>,
    ) -> Self {
        Self {
            node,
            address,
            interval,
            pd,
            ranges,
            lease,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            node = self.node,
            interval_ms = self.interval.as_millis() as u64,
            "heartbeat task started"
        );

        let mut heartbeat_count: u64 = 0;
        let mut failure_count: u64 = 0;

        loop {
            match self.beat().await {
                Ok(()) => {
                    heartbeat_count += 1;
                    failure_count = 0;
                    debug!(node = self.node, count = heartbeat_count, "heartbeat sent");
                }
                Err(e) => {
                    failure_count += 1;
                    error!(node = self.node, error = %e, failure_count, "heartbeat failed");
                    if failure_count >= 3 {
                        warn!(
                            node = self.node,
                            failure_count,
                            "repeated heartbeat failures, pd may consider this node dead"
                        );
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!(
            node = self.node,
            total = heartbeat_count,
            failures = failure_count,
            "heartbeat task stopped"
        );
    }

    async fn beat(&self) -> rangestream_core::Result<()> {
        let progress = self.ranges.progress().await;
        let commands = self
            .pd
            .heartbeat(self.node, self.address.clone(), progress)
            .await?;
        for command in commands {
            self.apply(command).await;
        }
        Ok(())
    }

    async fn apply(&self, command: NodeCommand) {
        match command {
            NodeCommand::BecomeLeader { metadata } => {
                // Acquire-on-demand does the actual work (and is a local
                // no-op when we already serve the lease).
                if let Err(e) = self.lease.ensure_leader(metadata.id).await {
                    debug!(range = %metadata.id, error = %e, "become-leader deferred");
                }
            }
            NodeCommand::StepDown { range, epoch } => {
                if let Some(replica) = self.ranges.get(range).await {
                    replica.step_down(epoch).await;
                }
            }
            NodeCommand::DropReplica { range } => {
                self.ranges.drop_replica(range).await;
            }
        }
    }
}
