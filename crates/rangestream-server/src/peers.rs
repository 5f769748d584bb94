//! Connections to peer range servers, for replication traffic.
//!
//! Addresses come from the PD node registry and are cached; a miss (or a
//! transport failure) refreshes the cache once before giving up — the
//! caller treats a failed peer call as a missing ack and the quorum rules
//! absorb it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rangestream_core::{Error, NodeId, Result};
use rangestream_pd::PlacementDriver;
use rangestream_proto::rs::{RsRequest, RsResponse};
use rangestream_proto::Connection;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

pub struct PeerPool {
    pd: Arc<dyn PlacementDriver>,
    timeout: Duration,
    addresses: RwLock<HashMap<NodeId, String>>,
    conns: Mutex<HashMap<NodeId, Arc<Mutex<Option<Connection<RsRequest, RsResponse>>>>>>,
}

impl PeerPool {
    pub fn new(pd: Arc<dyn PlacementDriver>, timeout: Duration) -> Self {
        Self {
            pd,
            timeout,
            addresses: RwLock::new(HashMap::new()),
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// Call a peer range server, reconnecting and refreshing its address
    /// once on transport failure.
    pub async fn call(&self, node: NodeId, request: RsRequest) -> Result<RsResponse> {
        let slot = self.slot(node).await;
        let mut guard = slot.lock().await;

        for attempt in 0..2 {
            if guard.is_none() {
                let address = match self.address(node, attempt > 0).await {
                    Ok(address) => address,
                    Err(e) => {
                        debug!(node, error = %e, "peer address lookup failed");
                        return Err(e);
                    }
                };
                match Connection::connect(&address, self.timeout).await {
                    Ok(conn) => *guard = Some(conn),
                    Err(e) => {
                        debug!(node, address, error = %e, "peer connect failed");
                        if attempt == 0 {
                            continue;
                        }
                        return Err(e);
                    }
                }
            }

            let conn = guard.as_mut().expect("connection just checked");
            match conn.call(request.clone(), self.timeout).await {
                Ok(response) => return Ok(response),
                Err(e @ (Error::Unavailable(_) | Error::Io(_))) => {
                    *guard = None;
                    if attempt == 0 {
                        continue;
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Unavailable(format!("peer {node} unreachable")))
    }

    async fn slot(&self, node: NodeId) -> Arc<Mutex<Option<Connection<RsRequest, RsResponse>>>> {
        let mut conns = self.conns.lock().await;
        conns
            .entry(node)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    async fn address(&self, node: NodeId, refresh: bool) -> Result<String> {
        if !refresh {
            if let Some(address) = self.addresses.read().await.get(&node) {
                return Ok(address.clone());
            }
        }

        let nodes = self.pd.list_nodes().await?;
        let mut addresses = self.addresses.write().await;
        for descriptor in &nodes {
            addresses.insert(descriptor.node, descriptor.address.clone());
        }
        addresses
            .get(&node)
            .cloned()
            .ok_or_else(|| Error::Unavailable(format!("peer {node} not registered with pd")))
    }
}
