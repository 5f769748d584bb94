//! Request dispatch: the range-server side of the wire protocol.

use std::sync::Arc;

use rangestream_core::{Epoch, Error, NewRecord, NodeId, RangeId, Result};
use rangestream_proto::rs::{RsRequest, RsResponse};
use tracing::debug;

use crate::lease::LeaseKeeper;
use crate::ranges::Ranges;
use crate::replication::Replicator;

pub struct RangeService {
    pub node: NodeId,
    pub ranges: Arc<Ranges>,
    pub lease: Arc<LeaseKeeper>,
    pub replicator: Arc<Replicator>,
}

impl RangeService {
    pub async fn handle(&self, request: RsRequest) -> Result<RsResponse> {
        match request {
            RsRequest::Append {
                range,
                epoch,
                records,
            } => self.append(range, epoch, records).await,

            RsRequest::Fetch {
                range,
                start_offset,
                max_records,
                max_bytes,
            } => self.fetch(range, start_offset, max_records, max_bytes).await,

            RsRequest::Replicate {
                metadata,
                base_offset,
                records,
                commit_index,
            } => {
                let replica = self.ranges.get_or_open(&metadata).await?;
                let (log_end, committed) = replica
                    .apply_replicate(&metadata, base_offset, records, commit_index)
                    .await?;
                Ok(RsResponse::Replicated { log_end, committed })
            }

            RsRequest::SealReplica { range, epoch } => {
                let replica = self
                    .ranges
                    .get(range)
                    .await
                    .ok_or(Error::RangeUnknown(range))?;
                let log_end = replica.seal(epoch).await?;
                Ok(RsResponse::Sealed { log_end })
            }

            RsRequest::ReadTail { range, epoch, from } => {
                let replica = self
                    .ranges
                    .get(range)
                    .await
                    .ok_or(Error::RangeUnknown(range))?;
                let (records, log_end) = replica.read_tail(epoch, from).await?;
                Ok(RsResponse::Tail { records, log_end })
            }

            RsRequest::Truncate {
                range,
                new_start_offset,
            } => {
                let replica = self
                    .ranges
                    .get(range)
                    .await
                    .ok_or(Error::RangeUnknown(range))?;
                let watermarks = replica.truncate_prefix(new_start_offset).await?;
                Ok(RsResponse::Truncated { watermarks })
            }

            RsRequest::Watermarks { range } => {
                let replica = self
                    .ranges
                    .get(range)
                    .await
                    .ok_or(Error::RangeUnknown(range))?;
                Ok(RsResponse::Watermarks {
                    watermarks: replica.watermarks().await,
                })
            }
        }
    }

    /// Leader append: lease check, serial offset assignment, durable local
    /// write, parallel fan-out, quorum commit.
    async fn append(
        &self,
        range: RangeId,
        epoch: Epoch,
        payloads: Vec<NewRecord>,
    ) -> Result<RsResponse> {
        self.lease.ensure_leader(range).await?;
        let replica = self
            .ranges
            .get(range)
            .await
            .ok_or(Error::RangeUnknown(range))?;

        // One append at a time per range; fetches are not blocked by this.
        let _guard = replica.lock_append().await;

        let (base_offset, records, metadata, commit_index) = replica
            .assign_and_append(epoch, payloads, crate::now_ms())
            .await?;
        let end_offset = base_offset + records.len() as u64;

        if metadata.replicas.len() <= 1 {
            replica.commit_to(end_offset).await;
            return Ok(RsResponse::Appended {
                base_offset,
                end_offset,
            });
        }

        let result = self
            .replicator
            .fan_out(&replica, &metadata, base_offset, &records, commit_index)
            .await;

        if let Some(newer) = result.stale_epoch {
            replica.step_down(newer).await;
            return Err(Error::StaleEpoch { current: newer });
        }

        let acks = result.acks + 1; // leader holds the batch durably
        if acks >= metadata.quorum() {
            replica.commit_to(end_offset).await;
            Ok(RsResponse::Appended {
                base_offset,
                end_offset,
            })
        } else {
            debug!(
                %range,
                acks,
                quorum = metadata.quorum(),
                "append failed to reach quorum"
            );
            Err(Error::Unavailable(format!(
                "replication quorum not reached ({acks}/{} acks)",
                metadata.quorum()
            )))
        }
    }

    /// Leader-only fetch of committed records.
    async fn fetch(
        &self,
        range: RangeId,
        start_offset: u64,
        max_records: u32,
        max_bytes: u32,
    ) -> Result<RsResponse> {
        // Fast path: we serve the lease already.
        if let Some(replica) = self.ranges.get(range).await {
            if replica.is_serving_leader().await {
                let (records, watermarks) =
                    replica.fetch(start_offset, max_records, max_bytes).await?;
                return Ok(RsResponse::Records {
                    records,
                    watermarks,
                });
            }
        }

        // Otherwise confirm with the PD; this renews when we do lead the
        // range and redirects when we do not.
        self.lease.ensure_leader(range).await?;
        let replica = self
            .ranges
            .get(range)
            .await
            .ok_or(Error::RangeUnknown(range))?;
        let (records, watermarks) = replica.fetch(start_offset, max_records, max_bytes).await?;
        Ok(RsResponse::Records {
            records,
            watermarks,
        })
    }
}
