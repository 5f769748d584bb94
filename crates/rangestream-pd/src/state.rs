//! The PD metadata state machine.
//!
//! All mutations arrive as [`Command`]s through the replicated log and are
//! applied deterministically: wall-clock readings are carried inside the
//! commands, placement is a round-robin cursor over the sorted node set,
//! and failover elections break ties by node id. Applying the same command
//! sequence on every PD replica yields the same state.

use std::collections::BTreeMap;

use rangestream_core::{
    Error, LeaderInfo, Lease, NodeDescriptor, NodeId, RangeId, RangeMetadata, ReplicaProgress,
    Result, StreamDescriptor, StreamId,
};
use rangestream_proto::pd::NodeCommand;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// A metadata mutation, linearized through the replicated log.
///
/// Commands must apply deterministically; anything clock- or
/// environment-dependent is resolved by the proposing leader and embedded
/// in the command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Range-server liveness heartbeat with per-replica progress.
    Heartbeat {
        node: NodeId,
        address: String,
        progress: Vec<ReplicaProgress>,
        now_ms: u64,
    },

    CreateStream {
        replica_count: u32,
    },

    DeleteStream {
        stream: StreamId,
    },

    /// Seal the open range at its committed high watermark and place the
    /// successor range.
    SealRange {
        range: RangeId,
    },

    RenewLease {
        range: RangeId,
        node: NodeId,
        progress: ReplicaProgress,
        now_ms: u64,
    },

    /// Failure-detection tick, proposed periodically by the PD leader.
    Tick {
        now_ms: u64,
    },
}

/// The outcome of applying a command, used to build the client response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    StreamCreated(StreamDescriptor),
    StreamDeleted,
    RangeSealed { range: RangeId, end_offset: u64 },
    LeaseGranted(Lease),
    HeartbeatAcked { commands: Vec<NodeCommand> },
    Ticked { failovers: u32 },
}

/// Deterministic-apply parameters, identical across PD replicas.
#[derive(Debug, Clone, Copy)]
pub struct StateConfig {
    pub lease_ttl_ms: u64,
    pub node_timeout_ms: u64,
}

#[derive(Debug, Clone)]
struct NodeState {
    address: String,
    last_heartbeat_ms: u64,
    alive: bool,
    /// Last reported progress per hosted replica.
    progress: BTreeMap<RangeId, ReplicaProgress>,
}

#[derive(Debug, Clone)]
struct RangeState {
    meta: RangeMetadata,
    lease_expires_ms: u64,
    /// A leader deposed by failover, pending a step-down notice on its next
    /// heartbeat.
    deposed: Option<NodeId>,
}

#[derive(Debug, Clone)]
struct StreamMeta {
    replica_count: u32,
    ranges: Vec<RangeState>,
}

/// The PD metadata state: node registry, streams, ranges, leases.
pub struct MetaState {
    config: StateConfig,
    next_stream_id: StreamId,
    placement_cursor: u64,
    nodes: BTreeMap<NodeId, NodeState>,
    streams: BTreeMap<StreamId, StreamMeta>,
}

impl MetaState {
    pub fn new(config: StateConfig) -> Self {
        Self {
            config,
            next_stream_id: 1,
            placement_cursor: 0,
            nodes: BTreeMap::new(),
            streams: BTreeMap::new(),
        }
    }

    /// Apply a committed command. Errors are deterministic outcomes (the
    /// state is unchanged) and are returned to the proposing caller.
    pub fn apply(&mut self, command: &Command) -> Result<Applied> {
        match command {
            Command::Heartbeat {
                node,
                address,
                progress,
                now_ms,
            } => self.apply_heartbeat(*node, address, progress, *now_ms),
            Command::CreateStream { replica_count } => self.apply_create_stream(*replica_count),
            Command::DeleteStream { stream } => self.apply_delete_stream(*stream),
            Command::SealRange { range } => self.apply_seal_range(*range),
            Command::RenewLease {
                range,
                node,
                progress,
                now_ms,
            } => self.apply_renew_lease(*range, *node, *progress, *now_ms),
            Command::Tick { now_ms } => Ok(Applied::Ticked {
                failovers: self.apply_tick(*now_ms),
            }),
        }
    }

    fn apply_heartbeat(
        &mut self,
        node: NodeId,
        address: &str,
        progress: &[ReplicaProgress],
        now_ms: u64,
    ) -> Result<Applied> {
        let entry = self.nodes.entry(node).or_insert_with(|| {
            info!(node, address, "range server registered");
            NodeState {
                address: address.to_string(),
                last_heartbeat_ms: now_ms,
                alive: true,
                progress: BTreeMap::new(),
            }
        });
        if !entry.alive {
            info!(node, "range server back from the dead");
        }
        entry.address = address.to_string();
        entry.last_heartbeat_ms = now_ms;
        entry.alive = true;
        for p in progress {
            entry.progress.insert(p.range, *p);
        }

        let commands = self.commands_for(node);
        Ok(Applied::HeartbeatAcked { commands })
    }

    /// Topology commands for a node, computed against its reported state.
    fn commands_for(&mut self, node: NodeId) -> Vec<NodeCommand> {
        let mut commands = Vec::new();

        // Leaderships this node currently holds, and pending step-downs.
        for stream in self.streams.values_mut() {
            for range in stream.ranges.iter_mut() {
                if range.meta.leader == node {
                    commands.push(NodeCommand::BecomeLeader {
                        metadata: range.meta.clone(),
                    });
                }
                if range.deposed == Some(node) {
                    commands.push(NodeCommand::StepDown {
                        range: range.meta.id,
                        epoch: range.meta.epoch,
                    });
                    range.deposed = None;
                }
            }
        }

        // Replicas of ranges that no longer exist.
        if let Some(state) = self.nodes.get(&node) {
            for range in state.progress.keys() {
                let exists = self
                    .streams
                    .get(&range.stream)
                    .map_or(false, |s| s.ranges.iter().any(|r| r.meta.id == *range));
                if !exists {
                    commands.push(NodeCommand::DropReplica { range: *range });
                }
            }
        }

        commands
    }

    fn apply_create_stream(&mut self, replica_count: u32) -> Result<Applied> {
        let replicas = self.place(replica_count as usize)?;
        let stream = self.next_stream_id;
        self.next_stream_id += 1;

        let meta = RangeMetadata {
            id: RangeId::new(stream, 0),
            start_offset: 0,
            end_offset: None,
            epoch: 1,
            leader: replicas[0],
            replicas,
        };
        info!(
            stream,
            replica_count,
            leader = meta.leader,
            "stream created"
        );
        self.streams.insert(
            stream,
            StreamMeta {
                replica_count,
                ranges: vec![RangeState {
                    meta,
                    lease_expires_ms: 0,
                    deposed: None,
                }],
            },
        );
        Ok(Applied::StreamCreated(self.descriptor(stream)?))
    }

    fn apply_delete_stream(&mut self, stream: StreamId) -> Result<Applied> {
        if self.streams.remove(&stream).is_none() {
            return Err(Error::StreamUnknown(stream));
        }
        info!(stream, "stream deleted");
        Ok(Applied::StreamDeleted)
    }

    fn apply_seal_range(&mut self, range: RangeId) -> Result<Applied> {
        // Committed end offset: the most advanced committed progress any
        // replica has reported (replicas never report beyond the truth).
        let end_offset = self.committed_offset(range);

        let replica_count = self
            .streams
            .get(&range.stream)
            .ok_or(Error::StreamUnknown(range.stream))?
            .replica_count;
        let successor_replicas = self.place(replica_count as usize)?;

        let stream = self
            .streams
            .get_mut(&range.stream)
            .ok_or(Error::StreamUnknown(range.stream))?;
        let last = stream
            .ranges
            .last_mut()
            .ok_or(Error::RangeUnknown(range))?;
        if last.meta.id != range {
            return Err(Error::RangeUnknown(range));
        }
        if let Some(end) = last.meta.end_offset {
            // Sealing is idempotent.
            return Ok(Applied::RangeSealed {
                range,
                end_offset: end,
            });
        }

        let end_offset = end_offset.max(last.meta.start_offset);
        last.meta.end_offset = Some(end_offset);

        let successor = RangeMetadata {
            id: RangeId::new(range.stream, range.index + 1),
            start_offset: end_offset,
            end_offset: None,
            epoch: 1,
            leader: successor_replicas[0],
            replicas: successor_replicas,
        };
        info!(%range, end_offset, successor = %successor.id, "range sealed");
        stream.ranges.push(RangeState {
            meta: successor,
            lease_expires_ms: 0,
            deposed: None,
        });

        Ok(Applied::RangeSealed { range, end_offset })
    }

    fn apply_renew_lease(
        &mut self,
        range: RangeId,
        node: NodeId,
        progress: ReplicaProgress,
        now_ms: u64,
    ) -> Result<Applied> {
        let ttl_ms = self.config.lease_ttl_ms;
        let state = self.range_state_mut(range)?;

        if state.meta.leader != node {
            debug!(%range, node, leader = state.meta.leader, "lease denied");
            return Err(Error::LeaseDenied {
                epoch: state.meta.epoch,
            });
        }

        state.lease_expires_ms = now_ms + ttl_ms;
        let lease = Lease {
            metadata: state.meta.clone(),
            ttl_ms,
        };
        if let Some(node_state) = self.nodes.get_mut(&node) {
            node_state.progress.insert(range, progress);
        }
        Ok(Applied::LeaseGranted(lease))
    }

    /// Failure detection: mark nodes dead on heartbeat timeout and re-elect
    /// every range a dead node leads. Returns the number of failovers.
    fn apply_tick(&mut self, now_ms: u64) -> u32 {
        for (id, node) in self.nodes.iter_mut() {
            if node.alive && now_ms.saturating_sub(node.last_heartbeat_ms) > self.config.node_timeout_ms
            {
                warn!(node = id, "range server missed heartbeats, marking dead");
                node.alive = false;
            }
        }

        let mut failovers = 0;
        let nodes = &self.nodes;
        for stream in self.streams.values_mut() {
            for range in stream.ranges.iter_mut() {
                let leader_alive = nodes
                    .get(&range.meta.leader)
                    .map_or(false, |n| n.alive);
                if leader_alive {
                    continue;
                }

                // New leader: surviving replica with the most advanced log,
                // ties broken by lowest node id.
                let winner = range
                    .meta
                    .replicas
                    .iter()
                    .filter(|id| nodes.get(*id).map_or(false, |n| n.alive))
                    .map(|id| {
                        let log_end = nodes[id]
                            .progress
                            .get(&range.meta.id)
                            .map_or(0, |p| p.log_end);
                        (log_end, std::cmp::Reverse(*id))
                    })
                    .max()
                    .map(|(_, std::cmp::Reverse(id))| id);

                match winner {
                    Some(new_leader) if new_leader != range.meta.leader => {
                        let old = range.meta.leader;
                        range.meta.epoch += 1;
                        range.meta.leader = new_leader;
                        range.lease_expires_ms = 0;
                        range.deposed = Some(old);
                        failovers += 1;
                        info!(
                            range = %range.meta.id,
                            old_leader = old,
                            new_leader,
                            epoch = range.meta.epoch,
                            "range leader re-elected"
                        );
                    }
                    // No surviving replica (or only the dead leader): keep
                    // the assignment; clients observe Unavailable until the
                    // node returns.
                    _ => {}
                }
            }
        }
        failovers
    }

    // ------------------------------------------------------------------
    // Reads (served from applied state by the PD leader)
    // ------------------------------------------------------------------

    pub fn descriptor(&self, stream: StreamId) -> Result<StreamDescriptor> {
        let meta = self
            .streams
            .get(&stream)
            .ok_or(Error::StreamUnknown(stream))?;
        Ok(StreamDescriptor {
            stream,
            replica_count: meta.replica_count,
            ranges: meta.ranges.iter().map(|r| r.meta.clone()).collect(),
        })
    }

    pub fn leader(&self, range: RangeId) -> Result<LeaderInfo> {
        let state = self.range_state(range)?;
        let node = state.meta.leader;
        let address = self
            .nodes
            .get(&node)
            .map(|n| n.address.clone())
            .ok_or_else(|| Error::Unavailable(format!("leader node {node} not registered")))?;
        Ok(LeaderInfo {
            node,
            address,
            epoch: state.meta.epoch,
        })
    }

    pub fn list_nodes(&self) -> Vec<NodeDescriptor> {
        self.nodes
            .iter()
            .map(|(id, n)| NodeDescriptor {
                node: *id,
                address: n.address.clone(),
                alive: n.alive,
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Round-robin placement over the sorted alive node set.
    fn place(&mut self, count: usize) -> Result<Vec<NodeId>> {
        let alive: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.alive)
            .map(|(id, _)| *id)
            .collect();
        if alive.len() < count || count == 0 {
            return Err(Error::NoCapacity {
                needed: count,
                healthy: alive.len(),
            });
        }

        let start = (self.placement_cursor as usize) % alive.len();
        self.placement_cursor += 1;
        Ok((0..count).map(|i| alive[(start + i) % alive.len()]).collect())
    }

    fn committed_offset(&self, range: RangeId) -> u64 {
        self.nodes
            .values()
            .filter_map(|n| n.progress.get(&range))
            .map(|p| p.committed)
            .max()
            .unwrap_or(0)
    }

    fn range_state(&self, range: RangeId) -> Result<&RangeState> {
        self.streams
            .get(&range.stream)
            .ok_or(Error::StreamUnknown(range.stream))?
            .ranges
            .iter()
            .find(|r| r.meta.id == range)
            .ok_or(Error::RangeUnknown(range))
    }

    fn range_state_mut(&mut self, range: RangeId) -> Result<&mut RangeState> {
        self.streams
            .get_mut(&range.stream)
            .ok_or(Error::StreamUnknown(range.stream))?
            .ranges
            .iter_mut()
            .find(|r| r.meta.id == range)
            .ok_or(Error::RangeUnknown(range))
    }

}
