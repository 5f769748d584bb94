//! The range-server TCP server and its background tasks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rangestream_core::{Error, Result};
use rangestream_pd::{PdClient, PlacementDriver};
use rangestream_proto::rs::RsRequest;
use rangestream_proto::{FrameCodec, RequestFrame, ResponseFrame};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::config::RangeServerConfig;
use crate::heartbeat::HeartbeatTask;
use crate::lease::LeaseKeeper;
use crate::peers::PeerPool;
use crate::ranges::Ranges;
use crate::replication::Replicator;
use crate::service::RangeService;

/// Timeout for peer replication calls.
const PEER_CALL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RangeServer;

impl RangeServer {
    /// Bind using a network PD client built from the configured endpoints.
    pub async fn bind(config: RangeServerConfig) -> Result<BoundRangeServer> {
        let pd: Arc<dyn PlacementDriver> = Arc::new(PdClient::new(config.pd_endpoints.clone()));
        Self::bind_with_pd(config, pd).await
    }

    /// Bind with an explicit placement driver (tests inject fakes here).
    pub async fn bind_with_pd(
        config: RangeServerConfig,
        pd: Arc<dyn PlacementDriver>,
    ) -> Result<BoundRangeServer> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let advertise_addr = config
            .advertise_addr
            .clone()
            .unwrap_or_else(|| local_addr.to_string());

        let ranges = Arc::new(Ranges::new(config.data_dir.clone(), config.sync_policy));
        let peers = Arc::new(PeerPool::new(pd.clone(), PEER_CALL_TIMEOUT));
        let replicator = Arc::new(Replicator::new(config.node, peers));
        let lease = Arc::new(LeaseKeeper::new(
            config.node,
            pd.clone(),
            ranges.clone(),
            replicator.clone(),
        ));
        let service = Arc::new(RangeService {
            node: config.node,
            ranges: ranges.clone(),
            lease: lease.clone(),
            replicator,
        });

        info!(node = config.node, %local_addr, advertise = advertise_addr, "range server listening");

        Ok(BoundRangeServer {
            listener,
            local_addr,
            advertise_addr,
            config,
            pd,
            ranges,
            lease,
            service,
        })
    }
}

/// A range server bound to its port but not yet serving.
pub struct BoundRangeServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    advertise_addr: String,
    config: RangeServerConfig,
    pd: Arc<dyn PlacementDriver>,
    ranges: Arc<Ranges>,
    lease: Arc<LeaseKeeper>,
    service: Arc<RangeService>,
}

impl BoundRangeServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start the accept loop, heartbeat, and lease renewal.
    pub fn start(self) -> RangeServerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let heartbeat = HeartbeatTask::new(
            self.config.node,
            self.advertise_addr.clone(),
            Duration::from_millis(self.config.heartbeat_interval_ms),
            self.pd.clone(),
            self.ranges.clone(),
            self.lease.clone(),
        );
        let heartbeat_task = tokio::spawn(heartbeat.run(shutdown_rx.clone()));

        let renewal_task = tokio::spawn(self.lease.clone().run(
            Duration::from_millis(self.config.heartbeat_interval_ms),
            shutdown_rx.clone(),
        ));

        let accept_task = tokio::spawn(accept_loop(
            self.listener,
            self.service,
            shutdown_rx,
        ));

        RangeServerHandle {
            node: self.config.node,
            local_addr: self.local_addr,
            shutdown: shutdown_tx,
            tasks: vec![accept_task, heartbeat_task, renewal_task],
        }
    }
}

/// Handle to a running range server.
pub struct RangeServerHandle {
    pub node: rangestream_core::NodeId,
    pub local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl RangeServerHandle {
    pub fn address(&self) -> String {
        self.local_addr.to_string()
    }

    /// Graceful stop: signal every task and wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }

    /// Hard stop, simulating a crash: connections drop, no goodbye to the
    /// PD — failure detection has to notice.
    pub fn kill(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    service: Arc<RangeService>,
    shutdown: watch::Receiver<bool>,
) {
    let mut shutdown_accept = shutdown.clone();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let service = service.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, service, shutdown).await {
                                debug!(%addr, error = %e, "connection closed");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                }
            }
            _ = shutdown_accept.changed() => {
                info!("range server shutting down");
                break;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    service: Arc<RangeService>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let mut framed = Framed::new(stream, FrameCodec::new());

    loop {
        let frame = tokio::select! {
            frame = framed.next() => frame,
            _ = shutdown.changed() => return Ok(()),
        };
        let Some(frame) = frame else {
            return Ok(());
        };
        let frame = frame?;

        let request: RequestFrame<RsRequest> = match bincode::deserialize(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "undecodable request");
                return Err(Error::Protocol(format!("undecodable request: {e}")));
            }
        };

        let result = service.handle(request.request).await;
        let response = ResponseFrame {
            correlation_id: request.correlation_id,
            result,
        };
        let encoded = bincode::serialize(&response)
            .map_err(|e| Error::Protocol(format!("encode response: {e}")))?;
        framed.send(Bytes::from(encoded)).await?;
    }
}
