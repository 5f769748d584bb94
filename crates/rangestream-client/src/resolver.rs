//! Topology resolution and range-server connections.
//!
//! Caches stream descriptors and leader lookups from the PD, invalidating
//! on any error that suggests the view is stale. Keeps one connection per
//! range-server address; a transport failure poisons that connection and
//! the next call reconnects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rangestream_core::{Error, LeaderInfo, RangeId, Result, StreamDescriptor, StreamId};
use rangestream_pd::PlacementDriver;
use rangestream_proto::rs::{RsRequest, RsResponse};
use rangestream_proto::Connection;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

pub struct Resolver {
    pd: Arc<dyn PlacementDriver>,
    timeout: Duration,
    descriptors: RwLock<HashMap<StreamId, StreamDescriptor>>,
    leaders: RwLock<HashMap<RangeId, LeaderInfo>>,
    conns: Mutex<HashMap<String, Arc<Mutex<Option<Connection<RsRequest, RsResponse>>>>>>,
}

impl Resolver {
    pub fn new(pd: Arc<dyn PlacementDriver>, timeout: Duration) -> Self {
        Self {
            pd,
            timeout,
            descriptors: RwLock::new(HashMap::new()),
            leaders: RwLock::new(HashMap::new()),
            conns: Mutex::new(HashMap::new()),
        }
    }

    pub async fn descriptor(&self, stream: StreamId, refresh: bool) -> Result<StreamDescriptor> {
        if !refresh {
            if let Some(descriptor) = self.descriptors.read().await.get(&stream) {
                return Ok(descriptor.clone());
            }
        }
        let descriptor = self.pd.describe_stream(stream).await?;
        self.descriptors
            .write()
            .await
            .insert(stream, descriptor.clone());
        Ok(descriptor)
    }

    pub async fn leader(&self, range: RangeId, refresh: bool) -> Result<LeaderInfo> {
        if !refresh {
            if let Some(leader) = self.leaders.read().await.get(&range) {
                return Ok(leader.clone());
            }
        }
        let leader = self.pd.get_leader(range).await?;
        self.leaders.write().await.insert(range, leader.clone());
        Ok(leader)
    }

    /// Drop cached topology for a stream after an error suggested it is
    /// stale.
    pub async fn invalidate(&self, stream: StreamId, range: RangeId) {
        self.descriptors.write().await.remove(&stream);
        self.leaders.write().await.remove(&range);
        debug!(stream, %range, "topology cache invalidated");
    }

    /// Call a range server, reconnecting once on transport failure.
    pub async fn call(&self, address: &str, request: RsRequest) -> Result<RsResponse> {
        let slot = {
            let mut conns = self.conns.lock().await;
            conns
                .entry(address.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .clone()
        };

        let mut guard = slot.lock().await;
        for attempt in 0..2 {
            if guard.is_none() {
                match Connection::connect(address, self.timeout).await {
                    Ok(conn) => *guard = Some(conn),
                    Err(e) => return Err(e),
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
        Err(Error::Unavailable(format!("range server {address} unreachable")))
    }
}
