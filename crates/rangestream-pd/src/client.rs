//! The PD client, used by range servers and end clients.
//!
//! [`PlacementDriver`] is the seam: range-server tasks and client-side
//! resolvers depend on the trait, so tests can substitute an in-memory
//! implementation. [`PdClient`] is the network implementation — it rotates
//! through the configured PD endpoints until one answers as leader.

use std::time::Duration;

use async_trait::async_trait;
use rangestream_core::{
    Error, Lease, LeaderInfo, NodeDescriptor, NodeId, RangeId, ReplicaProgress, Result,
    StreamDescriptor, StreamId,
};
use rangestream_proto::pd::{NodeCommand, PdRequest, PdResponse};
use rangestream_proto::Connection;
use tokio::sync::Mutex;
use tracing::debug;

/// Operations the placement driver offers to the rest of the cluster.
#[async_trait]
pub trait PlacementDriver: Send + Sync {
    async fn create_stream(&self, replica_count: u32) -> Result<StreamDescriptor>;
    async fn delete_stream(&self, stream: StreamId) -> Result<()>;
    async fn describe_stream(&self, stream: StreamId) -> Result<StreamDescriptor>;
    async fn get_leader(&self, range: RangeId) -> Result<LeaderInfo>;
    async fn list_nodes(&self) -> Result<Vec<NodeDescriptor>>;
    async fn seal_range(&self, range: RangeId) -> Result<u64>;
    async fn renew_lease(
        &self,
        range: RangeId,
        node: NodeId,
        progress: ReplicaProgress,
    ) -> Result<Lease>;
    async fn heartbeat(
        &self,
        node: NodeId,
        address: String,
        progress: Vec<ReplicaProgress>,
    ) -> Result<Vec<NodeCommand>>;
}

/// Network PD client.
pub struct PdClient {
    endpoints: Vec<String>,
    timeout: Duration,
    /// Current connection and the endpoint index it belongs to.
    conn: Mutex<Option<(usize, Connection<PdRequest, PdResponse>)>>,
}

impl PdClient {
    pub fn new(endpoints: Vec<String>) -> Self {
        assert!(!endpoints.is_empty(), "at least one pd endpoint required");
        Self {
            endpoints,
            timeout: Duration::from_secs(5),
            conn: Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Issue a request, rotating through endpoints on transport failures
    /// and not-leader redirects. Domain errors return immediately.
    async fn request(&self, request: PdRequest) -> Result<PdResponse> {
        let mut guard = self.conn.lock().await;
        let mut index = guard.as_ref().map(|(i, _)| *i).unwrap_or(0);
        let attempts = self.endpoints.len() * 2;
        let mut last_err = Error::Unavailable("no pd endpoint reachable".into());

        for attempt in 0..attempts {
            if guard.is_none() {
                let address = &self.endpoints[index % self.endpoints.len()];
                match Connection::connect(address, self.timeout).await {
                    Ok(conn) => *guard = Some((index, conn)),
                    Err(e) => {
                        debug!(endpoint = address, error = %e, "pd connect failed");
                        last_err = e;
                        index += 1;
                        continue;
                    }
                }
            }

            let (_, conn) = guard.as_mut().expect("connection just checked");
            match conn.call(request.clone(), self.timeout).await {
                Ok(response) => return Ok(response),
                // A follower or a dead endpoint: drop the connection and
                // try the next one. Everything else is a typed answer.
                Err(e @ (Error::Unavailable(_) | Error::Io(_))) => {
                    debug!(error = %e, "pd endpoint unavailable, rotating");
                    last_err = e;
                    *guard = None;
                    index += 1;
                    if attempt + 1 >= self.endpoints.len() {
                        // Went around once; give elections a moment.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err)
    }
}

#[async_trait]
impl PlacementDriver for PdClient {
    async fn create_stream(&self, replica_count: u32) -> Result<StreamDescriptor> {
        match self.request(PdRequest::CreateStream { replica_count }).await? {
            PdResponse::StreamCreated(descriptor) => Ok(descriptor),
            other => Err(unexpected(&other)),
        }
    }

    async fn delete_stream(&self, stream: StreamId) -> Result<()> {
        match self.request(PdRequest::DeleteStream { stream }).await? {
            PdResponse::StreamDeleted => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn describe_stream(&self, stream: StreamId) -> Result<StreamDescriptor> {
        match self.request(PdRequest::DescribeStream { stream }).await? {
            PdResponse::StreamInfo(descriptor) => Ok(descriptor),
            other => Err(unexpected(&other)),
        }
    }

    async fn get_leader(&self, range: RangeId) -> Result<LeaderInfo> {
        match self.request(PdRequest::GetLeader { range }).await? {
            PdResponse::Leader(leader) => Ok(leader),
            other => Err(unexpected(&other)),
        }
    }

    async fn list_nodes(&self) -> Result<Vec<NodeDescriptor>> {
        match self.request(PdRequest::ListNodes).await? {
            PdResponse::Nodes(nodes) => Ok(nodes),
            other => Err(unexpected(&other)),
        }
    }

    async fn seal_range(&self, range: RangeId) -> Result<u64> {
        match self.request(PdRequest::SealRange { range }).await? {
            PdResponse::Sealed { end_offset, .. } => Ok(end_offset),
            other => Err(unexpected(&other)),
        }
    }

    async fn renew_lease(
        &self,
        range: RangeId,
        node: NodeId,
        progress: ReplicaProgress,
    ) -> Result<Lease> {
        let request = PdRequest::RenewLease {
            range,
            node,
            progress,
        };
        match self.request(request).await? {
            PdResponse::Lease(lease) => Ok(lease),
            other => Err(unexpected(&other)),
        }
    }

    async fn heartbeat(
        &self,
        node: NodeId,
        address: String,
        progress: Vec<ReplicaProgress>,
    ) -> Result<Vec<NodeCommand>> {
        let request = PdRequest::Heartbeat {
            node,
            address,
            progress,
        };
        match self.request(request).await? {
            PdResponse::HeartbeatAck { commands } => Ok(commands),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &PdResponse) -> Error {
    Error::Internal(format!("unexpected pd response: {response:?}"))
}
