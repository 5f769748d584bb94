//! Consumer: sequential, batched consumption with correct resumption
//! across leader failover.
//!
//! The consumer owns a cursor (`next_offset`) that only moves forward, to
//! one past the last record it returned. Each poll resolves the range
//! containing the cursor (ranges are walked in offset order as sealed
//! ranges are exhausted), fetches from the range leader, and verifies the
//! batch is gapless and starts exactly at the cursor.
//!
//! Error discrimination on fetch:
//! - below the low watermark: retention removed unread data — `DataLoss`,
//!   terminal;
//! - at the high watermark: an empty batch, not an error;
//! - above the high watermark: transient after a failover (the new leader
//!   re-establishes its watermark), retried with backoff;
//! - leadership errors: re-resolve and retry.

use std::sync::Arc;
use std::time::Duration;

use rangestream_core::{Error, Record, StreamId};
use rangestream_pd::PlacementDriver;
use rangestream_proto::rs::{RsRequest, RsResponse};
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::resolver::Resolver;
use crate::retry::{retry_with_backoff, RetryPolicy};

pub struct ConsumerBuilder {
    pd: Option<Arc<dyn PlacementDriver>>,
    stream: Option<StreamId>,
    start_offset: u64,
    max_records: u32,
    max_bytes: u32,
    retry_policy: RetryPolicy,
    request_timeout: Duration,
}

impl ConsumerBuilder {
    pub fn new() -> Self {
        Self {
            pd: None,
            stream: None,
            start_offset: 0,
            max_records: 512,
            max_bytes: 4 * 1024 * 1024,
            retry_policy: RetryPolicy::default(),
            request_timeout: Duration::from_secs(5),
        }
    }

    /// Placement driver used for topology resolution. Required.
    pub fn pd(mut self, pd: Arc<dyn PlacementDriver>) -> Self {
        self.pd = Some(pd);
        self
    }

    /// Stream to consume. Required.
    pub fn stream(mut self, stream: StreamId) -> Self {
        self.stream = Some(stream);
        self
    }

    /// First offset to read (default 0).
    pub fn start_offset(mut self, offset: u64) -> Self {
        self.start_offset = offset;
        self
    }

    /// Per-poll record cap (default 512).
    pub fn max_records(mut self, max_records: u32) -> Self {
        self.max_records = max_records;
        self
    }

    /// Per-poll byte budget (default 4MB).
    pub fn max_bytes(mut self, max_bytes: u32) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<Consumer> {
        let pd = self
            .pd
            .ok_or_else(|| ClientError::Config("pd required".into()))?;
        let stream = self
            .stream
            .ok_or_else(|| ClientError::Config("stream required".into()))?;
        Ok(Consumer {
            resolver: Arc::new(Resolver::new(pd, self.request_timeout)),
            policy: self.retry_policy,
            stream,
            next_offset: self.start_offset,
            max_records: self.max_records,
            max_bytes: self.max_bytes,
        })
    }
}

impl Default for ConsumerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Consumer {
    resolver: Arc<Resolver>,
    policy: RetryPolicy,
    stream: StreamId,
    next_offset: u64,
    max_records: u32,
    max_bytes: u32,
}

impl Consumer {
    pub fn builder() -> ConsumerBuilder {
        ConsumerBuilder::new()
    }

    /// The cursor: the next offset this consumer will read.
    pub fn position(&self) -> u64 {
        self.next_offset
    }

    /// Fetch the next batch. Returns an empty batch when the cursor is at
    /// the high watermark (non-blocking poll).
    pub async fn poll(&mut self) -> Result<Vec<Record>> {
        let cursor = self.next_offset;
        let resolver = self.resolver.clone();
        let stream = self.stream;
        let (max_records, max_bytes) = (self.max_records, self.max_bytes);

        let records = retry_with_backoff(&self.policy, |attempt| {
            let resolver = resolver.clone();
            async move {
                Self::try_fetch(&resolver, stream, cursor, max_records, max_bytes, attempt > 0)
                    .await
            }
        })
        .await?;

        if let Some(last) = records.last() {
            // No gaps, no duplicates, and the batch starts at the cursor.
            let mut expected = cursor;
            for record in &records {
                if record.offset != expected {
                    return Err(ClientError::Cluster(Error::Internal(format!(
                        "fetch returned offset {} where {expected} was expected",
                        record.offset
                    ))));
                }
                expected += 1;
            }
            self.next_offset = last.offset + 1;
        }
        Ok(records)
    }

    /// Poll until records arrive or `timeout` elapses (bounded wait).
    pub async fn poll_wait(&mut self, timeout: Duration) -> Result<Vec<Record>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let records = self.poll().await?;
            if !records.is_empty() || tokio::time::Instant::now() >= deadline {
                return Ok(records);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn try_fetch(
        resolver: &Resolver,
        stream: StreamId,
        cursor: u64,
        max_records: u32,
        max_bytes: u32,
        refresh: bool,
    ) -> rangestream_core::Result<Vec<Record>> {
        let descriptor = resolver.descriptor(stream, refresh).await?;
        let range = match descriptor.range_for(cursor) {
            Some(range) => range.clone(),
            None => {
                // Either the cursor sits at the seal boundary and our view
                // predates the successor range, or the stream is fully
                // sealed and consumed.
                let descriptor = resolver.descriptor(stream, true).await?;
                match descriptor.range_for(cursor) {
                    Some(range) => range.clone(),
                    None => return Ok(Vec::new()),
                }
            }
        };

        let leader = resolver.leader(range.id, refresh).await?;
        let request = RsRequest::Fetch {
            range: range.id,
            start_offset: cursor,
            max_records,
            max_bytes,
        };

        match resolver.call(&leader.address, request).await {
            Ok(RsResponse::Records { records, .. }) => Ok(records),
            Ok(other) => Err(Error::Internal(format!(
                "unexpected fetch response: {other:?}"
            ))),
            Err(Error::OffsetOutOfRange {
                requested,
                low_watermark,
                high_watermark,
            }) => {
                if requested < low_watermark {
                    // Retention ran past the cursor: unread data is gone.
                    Err(Error::DataLoss {
                        requested,
                        low_watermark,
                    })
                } else {
                    // Above the high watermark. The cursor only ever moves
                    // past committed records, so this is a freshly failed-
                    // over leader still re-establishing its watermark:
                    // transient.
                    debug!(
                        stream,
                        range = %range.id,
                        requested,
                        high_watermark,
                        "cursor ahead of high watermark, retrying"
                    );
                    resolver.invalidate(stream, range.id).await;
                    Err(Error::Unavailable(format!(
                        "high watermark {high_watermark} behind cursor {requested}"
                    )))
                }
            }
            Err(e) => {
                debug!(stream, range = %range.id, error = %e, "fetch attempt failed");
                resolver.invalidate(stream, range.id).await;
                Err(e)
            }
        }
    }
}
