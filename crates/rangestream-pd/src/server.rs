//! The PD TCP server.
//!
//! Accepts framed connections from clients, range servers, and PD peers,
//! and dispatches requests: mutations are proposed through consensus,
//! reads are served from applied state by the leader, and raft traffic is
//! routed into the consensus task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rangestream_core::{Error, Result};
use rangestream_proto::pd::{PdRequest, PdResponse};
use rangestream_proto::{FrameCodec, RequestFrame, ResponseFrame};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, RwLock};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::config::PdConfig;
use crate::consensus::{self, ConsensusHandle, RaftLog};
use crate::state::{Applied, Command, MetaState, StateConfig};

pub struct PdServer;

impl PdServer {
    /// Open the replicated log, start consensus, and bind the listener.
    pub async fn bind(config: PdConfig) -> Result<BoundPdServer> {
        let log = RaftLog::open(&config.data_dir).await?;
        let state = Arc::new(RwLock::new(MetaState::new(StateConfig {
            lease_ttl_ms: config.lease_ttl_ms,
            node_timeout_ms: config.node_timeout_ms,
        })));

        // Range-server failure detection runs well inside the node timeout.
        let failure_tick = Duration::from_millis((config.node_timeout_ms / 2).max(50));
        let consensus = consensus::spawn(
            config.node,
            config.peers.clone(),
            log,
            state,
            Duration::from_millis(config.raft_tick_ms),
            failure_tick,
        );

        let listener = TcpListener::bind(&config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(node = config.node, %local_addr, peers = config.peers.len(), "pd listening");

        Ok(BoundPdServer {
            listener,
            local_addr,
            consensus,
        })
    }
}

/// A PD server bound to its port but not yet serving.
pub struct BoundPdServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    consensus: ConsensusHandle,
}

impl BoundPdServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawn the accept loop; the returned handle stops it.
    pub fn start(self) -> PdHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let local_addr = self.local_addr;
        let task = tokio::spawn(self.run_until(shutdown_rx));
        PdHandle {
            local_addr,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    /// Serve until the shutdown signal fires.
    pub async fn run_until(self, shutdown: oneshot::Receiver<()>) -> Result<()> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let consensus = self.consensus.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, consensus).await {
                                    debug!(%addr, error = %e, "pd connection closed");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "pd accept failed"),
                    }
                }
                _ = &mut shutdown => {
                    info!("pd shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Handle to a running PD server.
pub struct PdHandle {
    pub local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<Result<()>>,
}

impl PdHandle {
    pub fn address(&self) -> String {
        self.local_addr.to_string()
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }

    /// Stop without waiting (used by tests to simulate a crash).
    pub fn abort(self) {
        self.task.abort();
    }
}

async fn handle_connection(stream: TcpStream, consensus: ConsensusHandle) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let mut framed = Framed::new(stream, FrameCodec::new());

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let request: RequestFrame<PdRequest> = match bincode::deserialize(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "undecodable pd request");
                return Err(Error::Protocol(format!("undecodable request: {e}")));
            }
        };

        let result = dispatch(&consensus, request.request).await;
        let response = ResponseFrame {
            correlation_id: request.correlation_id,
            result,
        };
        let encoded = bincode::serialize(&response)
            .map_err(|e| Error::Protocol(format!("encode response: {e}")))?;
        framed.send(Bytes::from(encoded)).await?;
    }

    Ok(())
}

async fn dispatch(consensus: &ConsensusHandle, request: PdRequest) -> Result<PdResponse> {
    match request {
        PdRequest::Raft(message) => Ok(PdResponse::Raft(consensus.raft(message).await?)),

        PdRequest::CreateStream { replica_count } => {
            match consensus.propose(Command::CreateStream { replica_count }).await? {
                Applied::StreamCreated(descriptor) => Ok(PdResponse::StreamCreated(descriptor)),
                other => Err(unexpected(other)),
            }
        }

        PdRequest::DeleteStream { stream } => {
            match consensus.propose(Command::DeleteStream { stream }).await? {
                Applied::StreamDeleted => Ok(PdResponse::StreamDeleted),
                other => Err(unexpected(other)),
            }
        }

        PdRequest::SealRange { range } => {
            match consensus.propose(Command::SealRange { range }).await? {
                Applied::RangeSealed { range, end_offset } => {
                    Ok(PdResponse::Sealed { range, end_offset })
                }
                other => Err(unexpected(other)),
            }
        }

        PdRequest::RenewLease {
            range,
            node,
            progress,
        } => {
            let command = Command::RenewLease {
                range,
                node,
                progress,
                now_ms: crate::now_ms(),
            };
            match consensus.propose(command).await? {
                Applied::LeaseGranted(lease) => Ok(PdResponse::Lease(lease)),
                other => Err(unexpected(other)),
            }
        }

        PdRequest::Heartbeat {
            node,
            address,
            progress,
        } => {
            let command = Command::Heartbeat {
                node,
                address,
                progress,
                now_ms: crate::now_ms(),
            };
            match consensus.propose(command).await? {
                Applied::HeartbeatAcked { commands } => Ok(PdResponse::HeartbeatAck { commands }),
                other => Err(unexpected(other)),
            }
        }

        // Reads are leader-only: follower state may lag behind commit.
        PdRequest::DescribeStream { stream } => {
            let state = leader_state(consensus)?;
            let descriptor = state.read().await.descriptor(stream)?;
            Ok(PdResponse::StreamInfo(descriptor))
        }

        PdRequest::GetLeader { range } => {
            let state = leader_state(consensus)?;
            let leader = state.read().await.leader(range)?;
            Ok(PdResponse::Leader(leader))
        }

        PdRequest::ListNodes => {
            let state = leader_state(consensus)?;
            let nodes = state.read().await.list_nodes();
            Ok(PdResponse::Nodes(nodes))
        }
    }
}

fn leader_state(consensus: &ConsensusHandle) -> Result<Arc<RwLock<MetaState>>> {
    if !consensus.is_leader() {
        let role = consensus.role();
        return Err(Error::Unavailable(match role.leader {
            Some(leader) => format!("not the pd leader; try pd node {leader}"),
            None => "no pd leader elected".to_string(),
        }));
    }
    Ok(consensus.state())
}

fn unexpected(applied: Applied) -> Error {
    Error::Internal(format!("unexpected apply outcome: {applied:?}"))
}
