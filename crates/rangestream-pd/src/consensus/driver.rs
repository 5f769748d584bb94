//! The consensus driver task.
//!
//! Owns the [`RaftCore`], exchanges messages with PD peers, applies
//! committed commands to the shared [`MetaState`], and resolves proposal
//! waiters by log index. The PD leader also proposes periodic
//! failure-detection ticks through the log so every replica observes the
//! same liveness transitions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rangestream_core::{Error, NodeId, Result};
use rangestream_proto::pd::{PdRequest, PdResponse, RaftRequest, RaftResponse};
use rangestream_proto::Connection;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::config::PeerConfig;
use crate::state::{Applied, Command, MetaState};

use super::core::{Outbound, RaftCore};
use super::log::RaftLog;

/// Timeout for a single peer-to-peer consensus call.
const PEER_CALL_TIMEOUT: Duration = Duration::from_secs(1);

/// Current role, published on a watch channel for the server's read path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleInfo {
    pub is_leader: bool,
    pub leader: Option<NodeId>,
    pub term: u64,
}

enum NodeInput {
    Request {
        request: RaftRequest,
        reply: oneshot::Sender<Result<RaftResponse>>,
    },
    Response {
        from: NodeId,
        response: RaftResponse,
    },
    Propose {
        command: Command,
        reply: oneshot::Sender<Result<Applied>>,
    },
}

/// Handle to the consensus task.
#[derive(Clone)]
pub struct ConsensusHandle {
    tx: mpsc::Sender<NodeInput>,
    role_rx: watch::Receiver<RoleInfo>,
    state: Arc<RwLock<MetaState>>,
}

impl ConsensusHandle {
    /// Propose a metadata command and await its applied outcome.
    pub async fn propose(&self, command: Command) -> Result<Applied> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(NodeInput::Propose { command, reply })
            .await
            .map_err(|_| Error::Unavailable("pd consensus task stopped".into()))?;
        rx.await
            .map_err(|_| Error::Unavailable("pd consensus task stopped".into()))?
    }

    /// Route an inbound peer message through the core.
    pub async fn raft(&self, request: RaftRequest) -> Result<RaftResponse> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(NodeInput::Request { request, reply })
            .await
            .map_err(|_| Error::Unavailable("pd consensus task stopped".into()))?;
        rx.await
            .map_err(|_| Error::Unavailable("pd consensus task stopped".into()))?
    }

    pub fn is_leader(&self) -> bool {
        self.role_rx.borrow().is_leader
    }

    pub fn role(&self) -> RoleInfo {
        self.role_rx.borrow().clone()
    }

    /// The applied metadata state. Read it only after checking
    /// [`Self::is_leader`]; follower state may lag.
    pub fn state(&self) -> Arc<RwLock<MetaState>> {
        self.state.clone()
    }
}

/// One reconnecting connection per PD peer, calls serialized.
struct PeerTransport {
    address: String,
    conn: Mutex<Option<Connection<PdRequest, PdResponse>>>,
}

impl PeerTransport {
    async fn call(&self, request: PdRequest) -> Result<PdResponse> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(Connection::connect(&self.address, PEER_CALL_TIMEOUT).await?);
        }
        let conn = guard.as_mut().expect("connection just established");
        match conn.call(request, PEER_CALL_TIMEOUT).await {
            Ok(response) => Ok(response),
            Err(e) => {
                // Poisoned; reconnect on the next call.
                *guard = None;
                Err(e)
            }
        }
    }
}

/// Spawn the consensus task. `failure_tick` is the interval at which the
/// leader proposes [`Command::Tick`] for range-server failure detection.
pub fn spawn(
    id: NodeId,
    peers: Vec<PeerConfig>,
    log: RaftLog,
    state: Arc<RwLock<MetaState>>,
    tick_interval: Duration,
    failure_tick: Duration,
) -> ConsensusHandle {
    let peer_ids: Vec<NodeId> = peers.iter().map(|p| p.node).collect();
    let transports: HashMap<NodeId, Arc<PeerTransport>> = peers
        .into_iter()
        .map(|p| {
            (
                p.node,
                Arc::new(PeerTransport {
                    address: p.address,
                    conn: Mutex::new(None),
                }),
            )
        })
        .collect();

    let core = RaftCore::new(id, peer_ids, log);
    let (tx, rx) = mpsc::channel(1024);
    let (role_tx, role_rx) = watch::channel(RoleInfo {
        is_leader: false,
        leader: None,
        term: 0,
    });

    let handle = ConsensusHandle {
        tx: tx.clone(),
        role_rx,
        state: state.clone(),
    };

    tokio::spawn(run(
        core,
        state,
        transports,
        tx,
        rx,
        role_tx,
        tick_interval,
        failure_tick,
    ));

    handle
}

#[allow(clippy::too_many_arguments)]
async fn run(
    mut core: RaftCore,
    state: Arc<RwLock<MetaState>>,
    transports: HashMap<NodeId, Arc<PeerTransport>>,
    tx: mpsc::Sender<NodeInput>,
    mut rx: mpsc::Receiver<NodeInput>,
    role_tx: watch::Sender<RoleInfo>,
    tick_interval: Duration,
    failure_tick: Duration,
) {
    let mut waiters: HashMap<u64, oneshot::Sender<Result<Applied>>> = HashMap::new();
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut failure_ticker = tokio::time::interval(failure_tick);
    failure_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let step: Result<()> = tokio::select! {
            _ = ticker.tick() => match core.tick().await {
                Ok(out) => {
                    send_all(&transports, &tx, out);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            _ = failure_ticker.tick() => {
                if core.is_leader() {
                    let command = Command::Tick { now_ms: crate::now_ms() };
                    match encode(&command) {
                        Ok(encoded) => match core.propose(encoded).await {
                            Ok((_, out)) => {
                                send_all(&transports, &tx, out);
                                Ok(())
                            }
                            // A race with losing leadership is harmless.
                            Err(Error::Unavailable(_)) => Ok(()),
                            Err(e) => Err(e),
                        },
                        Err(e) => Err(e),
                    }
                } else {
                    Ok(())
                }
            },
            input = rx.recv() => match input {
                None => break,
                Some(NodeInput::Request { request, reply }) => {
                    match core.handle_request(request).await {
                        Ok(response) => {
                            let _ = reply.send(Ok(response));
                            Ok(())
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e.clone()));
                            Err(e)
                        }
                    }
                }
                Some(NodeInput::Response { from, response }) => {
                    match core.handle_response(from, response).await {
                        Ok(out) => {
                            send_all(&transports, &tx, out);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                Some(NodeInput::Propose { command, reply }) => {
                    match encode(&command) {
                        Ok(encoded) => match core.propose(encoded).await {
                            Ok((index, out)) => {
                                waiters.insert(index, reply);
                                send_all(&transports, &tx, out);
                                Ok(())
                            }
                            Err(e) => {
                                let _ = reply.send(Err(e));
                                Ok(())
                            }
                        },
                        Err(e) => {
                            let _ = reply.send(Err(e));
                            Ok(())
                        }
                    }
                }
            },
        };

        if let Err(e) = step {
            // Log durability failures are fatal to this PD node.
            error!(error = %e, "pd consensus failure, stopping");
            break;
        }

        // Apply newly committed commands and resolve their waiters.
        while let Some(entry) = core.next_unapplied() {
            let outcome = if entry.command.is_empty() {
                // Election no-op.
                None
            } else {
                match bincode::deserialize::<Command>(&entry.command) {
                    Ok(command) => {
                        let applied = state.write().await.apply(&command);
                        if let Err(e) = &applied {
                            debug!(index = entry.index, error = %e, "command rejected");
                        }
                        Some(applied)
                    }
                    Err(e) => {
                        error!(index = entry.index, error = %e, "undecodable command in pd log");
                        Some(Err(Error::Corrupt(format!(
                            "undecodable command at index {}",
                            entry.index
                        ))))
                    }
                }
            };
            if let Some(waiter) = waiters.remove(&entry.index) {
                let _ = waiter.send(outcome.unwrap_or_else(|| {
                    Err(Error::Internal("waiter registered on a no-op entry".into()))
                }));
            }
        }

        // Abort in-flight proposals if leadership was lost: their log
        // entries may be overwritten by the new leader.
        if !core.is_leader() && !waiters.is_empty() {
            warn!(count = waiters.len(), "failing proposals after losing pd leadership");
            for (_, waiter) in waiters.drain() {
                let _ = waiter.send(Err(Error::Unavailable("pd leadership lost".into())));
            }
        }

        let _ = role_tx.send_replace(RoleInfo {
            is_leader: core.is_leader(),
            leader: core.leader_hint(),
            term: core.term(),
        });
    }
}

fn encode(command: &Command) -> Result<Vec<u8>> {
    bincode::serialize(command).map_err(|e| Error::Internal(format!("encode command: {e}")))
}

fn send_all(
    transports: &HashMap<NodeId, Arc<PeerTransport>>,
    tx: &mpsc::Sender<NodeInput>,
    outbound: Vec<Outbound>,
) {
    for message in outbound {
        let Some(transport) = transports.get(&message.to).cloned() else {
            warn!(peer = message.to, "no transport for pd peer");
            continue;
        };
        let tx = tx.clone();
        tokio::spawn(async move {
            match transport.call(PdRequest::Raft(message.request)).await {
                Ok(PdResponse::Raft(response)) => {
                    let _ = tx
                        .send(NodeInput::Response {
                            from: message.to,
                            response,
                        })
                        .await;
                }
                Ok(_) => {
                    warn!(peer = message.to, "unexpected response to raft message");
                }
                // Unreachable peers are retried by the next tick.
                Err(e) => {
                    debug!(peer = message.to, error = %e, "raft send failed");
                }
            }
        });
    }
}
