//! Producer: reliable, ordered append with retry across leader changes.
//!
//! Every attempt resolves the stream's open range and its leader through
//! the (cached) PD view, appends with the resolved epoch, and on any
//! leadership error drops the cached view before backing off — so the next
//! attempt sees fresh topology. Acknowledged appends are quorum-committed.
//!
//! Semantics are at-least-once: an append that failed mid-flight may have
//! committed, and the retry will append it again at a later offset.
//!
//! ## Example
//!
//! ```ignore
//! let producer = Producer::builder()
//!     .pd(pd_client)
//!     .build()?;
//!
//! let offset = producer.send(stream, None, Bytes::from("payload")).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rangestream_core::{Error, NewRecord, StreamId};
use rangestream_pd::PlacementDriver;
use rangestream_proto::rs::{RsRequest, RsResponse};
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::resolver::Resolver;
use crate::retry::{retry_with_backoff, RetryPolicy};

pub struct ProducerBuilder {
    pd: Option<Arc<dyn PlacementDriver>>,
    retry_policy: RetryPolicy,
    request_timeout: Duration,
}

impl ProducerBuilder {
    pub fn new() -> Self {
        Self {
            pd: None,
            retry_policy: RetryPolicy::default(),
            request_timeout: Duration::from_secs(5),
        }
    }

    /// Placement driver used for topology resolution. Required.
    pub fn pd(mut self, pd: Arc<dyn PlacementDriver>) -> Self {
        self.pd = Some(pd);
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

    pub fn build(self) -> Result<Producer> {
        let pd = self
            .pd
            .ok_or_else(|| ClientError::Config("pd required".into()))?;
        Ok(Producer {
            resolver: Arc::new(Resolver::new(pd, self.request_timeout)),
            policy: self.retry_policy,
        })
    }
}

impl Default for ProducerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Producer {
    resolver: Arc<Resolver>,
    policy: RetryPolicy,
}

impl Producer {
    pub fn builder() -> ProducerBuilder {
        ProducerBuilder::new()
    }

    /// Append a single record; returns its assigned offset.
    pub async fn send(
        &self,
        stream: StreamId,
        key: Option<Bytes>,
        value: Bytes,
    ) -> Result<u64> {
        self.send_batch(stream, vec![NewRecord::new(key, value)])
            .await
    }

    /// Append a batch; returns the base offset of the batch (records get
    /// consecutive offsets from there).
    pub async fn send_batch(&self, stream: StreamId, records: Vec<NewRecord>) -> Result<u64> {
        if records.is_empty() {
            return Err(ClientError::Config("empty batch".into()));
        }

        let base = retry_with_backoff(&self.policy, |attempt| {
            let records = records.clone();
            async move { self.try_send(stream, records, attempt > 0).await }
        })
        .await?;
        Ok(base)
    }

    async fn try_send(
        &self,
        stream: StreamId,
        records: Vec<NewRecord>,
        refresh: bool,
    ) -> rangestream_core::Result<u64> {
        let descriptor = self.resolver.descriptor(stream, refresh).await?;
        let open = match descriptor.open_range() {
            Some(open) => open.clone(),
            None => {
                // Sealed-only view; a successor range should exist by now.
                let descriptor = self.resolver.descriptor(stream, true).await?;
                descriptor
                    .open_range()
                    .cloned()
                    .ok_or_else(|| Error::Unavailable(format!("stream {stream} has no open range")))?
            }
        };

        let leader = self.resolver.leader(open.id, refresh).await?;
        let request = RsRequest::Append {
            range: open.id,
            epoch: leader.epoch,
            records,
        };

        match self.resolver.call(&leader.address, request).await {
            Ok(RsResponse::Appended { base_offset, .. }) => Ok(base_offset),
            Ok(other) => Err(Error::Internal(format!(
                "unexpected append response: {other:?}"
            ))),
            Err(e) => {
                debug!(stream, range = %open.id, error = %e, "append attempt failed");
                self.resolver.invalidate(stream, open.id).await;
                Err(e)
            }
        }
    }
}
