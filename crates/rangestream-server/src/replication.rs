//! Leader-side replication: parallel fan-out, follower catch-up, and the
//! takeover reconciliation that re-establishes the high watermark under a
//! new epoch.
//!
//! The leader writes locally first (the append path made the batch durable
//! before calling in here), then ships the batch to every follower in
//! parallel. A follower that is behind answers with its log end and the
//! leader resends from there, a few rounds at most. The batch counts as
//! committed once a quorum of the replica set — leader included — holds it.

use std::sync::Arc;

use rangestream_core::{Epoch, NodeId, RangeMetadata, Record, Error};
use rangestream_proto::rs::{RsRequest, RsResponse};
use tracing::{debug, info, warn};

use crate::peers::PeerPool;
use crate::replica::Replica;

/// Bounded catch-up rounds per follower per batch.
const CATCH_UP_ROUNDS: usize = 4;

pub struct FanOutResult {
    /// Followers whose log end reached the batch end.
    pub acks: usize,

    /// A follower answered with a newer epoch: this leader is deposed.
    pub stale_epoch: Option<Epoch>,
}

pub struct Replicator {
    pub node: NodeId,
    pub peers: Arc<PeerPool>,
}

impl Replicator {
    pub fn new(node: NodeId, peers: Arc<PeerPool>) -> Self {
        Self { node, peers }
    }

    /// Replicate `[base_offset, base_offset + records.len())` to all
    /// followers in parallel.
    pub async fn fan_out(
        &self,
        replica: &Arc<Replica>,
        metadata: &RangeMetadata,
        base_offset: u64,
        records: &[Record],
        commit_index: u64,
    ) -> FanOutResult {
        let end_offset = base_offset + records.len() as u64;
        let followers: Vec<NodeId> = metadata
            .replicas
            .iter()
            .copied()
            .filter(|n| *n != self.node)
            .collect();

        let results = futures::future::join_all(followers.iter().map(|follower| {
            self.replicate_follower(
                *follower,
                replica,
                metadata,
                base_offset,
                records.to_vec(),
                commit_index,
                end_offset,
            )
        }))
        .await;

        let mut out = FanOutResult {
            acks: 0,
            stale_epoch: None,
        };
        for result in results {
            match result {
                Ok(true) => out.acks += 1,
                Ok(false) => {}
                Err(Error::StaleEpoch { current }) => {
                    out.stale_epoch =
                        Some(out.stale_epoch.map_or(current, |e: Epoch| e.max(current)));
                }
                Err(_) => {}
            }
        }
        out
    }

    /// Ship a batch to one follower, resending from its log end when it is
    /// behind. Returns whether the follower reached `end_offset`.
    #[allow(clippy::too_many_arguments)]
    async fn replicate_follower(
        &self,
        follower: NodeId,
        replica: &Arc<Replica>,
        metadata: &RangeMetadata,
        mut base_offset: u64,
        mut records: Vec<Record>,
        commit_index: u64,
        end_offset: u64,
    ) -> rangestream_core::Result<bool> {
        for round in 0..CATCH_UP_ROUNDS {
            let request = RsRequest::Replicate {
                metadata: metadata.clone(),
                base_offset,
                records: records.clone(),
                commit_index,
            };
            let log_end = match self.peers.call(follower, request).await {
                Ok(RsResponse::Replicated { log_end, .. }) => log_end,
                Ok(other) => {
                    warn!(follower, ?other, "unexpected replicate response");
                    return Ok(false);
                }
                Err(e @ Error::StaleEpoch { .. }) => return Err(e),
                Err(e) => {
                    debug!(follower, range = %metadata.id, error = %e, "replicate failed");
                    return Ok(false);
                }
            };

            if log_end >= end_offset {
                return Ok(true);
            }

            // Behind: resend from the follower's log end.
            debug!(
                follower,
                range = %metadata.id,
                log_end,
                end_offset,
                round,
                "follower behind, resending"
            );
            records = replica.slice(log_end, end_offset).await;
            if records.is_empty() {
                // The tail it needs was truncated by retention; nothing
                // more to ship this round.
                return Ok(false);
            }
            base_offset = log_end;
        }
        Ok(false)
    }

    /// Takeover reconciliation: a newly promoted leader fences the other
    /// replicas at its epoch, adopts the longest surviving log (a sealed
    /// survivor may hold quorum-committed records the election could not
    /// see in its stale progress view), re-replicates the tail, and
    /// advances the high watermark once a quorum holds the whole log.
    pub async fn reconcile(&self, replica: Arc<Replica>, metadata: RangeMetadata) {
        let quorum = metadata.quorum();

        if metadata.replicas.len() <= 1 {
            // Sole replica: everything durable is committed.
            let (committed, log_end, _) = replica.tail().await;
            replica.commit_to(log_end).await;
            if log_end > committed {
                info!(range = %metadata.id, committed = log_end, "reconciled single-replica range");
            }
            return;
        }

        // Fence the peers at our epoch so a deposed leader cannot commit
        // behind our back while we re-replicate, and learn their log ends.
        let mut survivor_ends: Vec<(NodeId, u64)> = Vec::new();
        for follower in metadata.replicas.iter().filter(|n| **n != self.node) {
            match self
                .peers
                .call(
                    *follower,
                    RsRequest::SealReplica {
                        range: metadata.id,
                        epoch: metadata.epoch,
                    },
                )
                .await
            {
                Ok(RsResponse::Sealed { log_end }) => {
                    debug!(follower = *follower, log_end, "replica fenced");
                    survivor_ends.push((*follower, log_end));
                }
                Ok(other) => warn!(follower = *follower, ?other, "unexpected seal response"),
                Err(e) => debug!(follower = *follower, error = %e, "seal failed"),
            }
        }

        // Adopt from the longest survivor when it is ahead of us.
        let (_, mut log_end, _) = replica.tail().await;
        if let Some((source, source_end)) = survivor_ends
            .iter()
            .copied()
            .max_by_key(|(node, end)| (*end, std::cmp::Reverse(*node)))
        {
            while source_end > log_end {
                let pulled = match self
                    .peers
                    .call(
                        source,
                        RsRequest::ReadTail {
                            range: metadata.id,
                            epoch: metadata.epoch,
                            from: log_end,
                        },
                    )
                    .await
                {
                    Ok(RsResponse::Tail { records, .. }) => records,
                    Ok(other) => {
                        warn!(source, ?other, "unexpected tail response");
                        break;
                    }
                    Err(e) => {
                        warn!(source, error = %e, "tail pull failed");
                        break;
                    }
                };
                if pulled.is_empty() {
                    break;
                }
                info!(
                    range = %metadata.id,
                    source,
                    from = log_end,
                    pulled = pulled.len(),
                    "adopting longer survivor log"
                );
                if let Err(e) = replica.adopt_tail(&pulled).await {
                    warn!(range = %metadata.id, error = %e, "tail adoption failed");
                    break;
                }
                log_end = replica.tail().await.1;
            }
        }

        let (committed, log_end, tail) = replica.tail().await;
        let result = self
            .fan_out(&replica, &metadata, committed, &tail, committed)
            .await;
        if let Some(newer) = result.stale_epoch {
            warn!(range = %metadata.id, newer, "deposed during reconciliation");
            replica.step_down(newer).await;
            return;
        }
        if result.acks + 1 >= quorum {
            replica.commit_to(log_end).await;
            info!(
                range = %metadata.id,
                epoch = metadata.epoch,
                committed = log_end,
                "takeover reconciled, high watermark re-established"
            );
        } else {
            warn!(
                range = %metadata.id,
                acks = result.acks,
                quorum,
                "reconciliation short of quorum, keeping old high watermark"
            );
        }
    }
}
