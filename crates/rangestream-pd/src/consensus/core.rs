//! The Raft protocol state machine, sans-I/O apart from the durable log.
//!
//! `RaftCore` consumes ticks and inbound messages and returns the outbound
//! messages the driver must deliver. It never touches the network, which
//! keeps election and replication rules unit-testable.

use std::collections::{BTreeMap, BTreeSet};

use rand::Rng;
use rangestream_core::{Error, NodeId, Result};
use rangestream_proto::pd::{LogEntry, RaftRequest, RaftResponse};
use tracing::{debug, info};

use super::log::RaftLog;
use super::{ELECTION_TIMEOUT_TICKS, HEARTBEAT_TICKS, MAX_APPEND_ENTRIES};

/// A message to deliver to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: NodeId,
    pub request: RaftRequest,
}

enum Role {
    Follower {
        leader: Option<NodeId>,
    },
    Candidate {
        votes: BTreeSet<NodeId>,
    },
    Leader {
        next_index: BTreeMap<NodeId, u64>,
        match_index: BTreeMap<NodeId, u64>,
    },
}

pub struct RaftCore {
    id: NodeId,
    peers: Vec<NodeId>,
    log: RaftLog,
    role: Role,
    commit_index: u64,
    applied_index: u64,
    election_elapsed: u32,
    election_timeout: u32,
    heartbeat_elapsed: u32,
}

impl RaftCore {
    pub fn new(id: NodeId, peers: Vec<NodeId>, log: RaftLog) -> Self {
        Self {
            id,
            peers,
            log,
            role: Role::Follower { leader: None },
            commit_index: 0,
            applied_index: 0,
            election_elapsed: 0,
            election_timeout: rand::thread_rng().gen_range(ELECTION_TIMEOUT_TICKS),
            heartbeat_elapsed: 0,
        }
    }

    /// Cluster size, this node included.
    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    fn quorum(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    pub fn term(&self) -> u64 {
        self.log.term()
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader { .. })
    }

    /// The node believed to be leader, self included.
    pub fn leader_hint(&self) -> Option<NodeId> {
        match &self.role {
            Role::Leader { .. } => Some(self.id),
            Role::Follower { leader } => *leader,
            Role::Candidate { .. } => None,
        }
    }

    /// Advance time by one tick.
    pub async fn tick(&mut self) -> Result<Vec<Outbound>> {
        match &mut self.role {
            Role::Leader { .. } => {
                self.heartbeat_elapsed += 1;
                if self.heartbeat_elapsed >= HEARTBEAT_TICKS {
                    self.heartbeat_elapsed = 0;
                    return Ok(self.broadcast_appends());
                }
                Ok(Vec::new())
            }
            Role::Follower { .. } | Role::Candidate { .. } => {
                self.election_elapsed += 1;
                if self.election_elapsed >= self.election_timeout {
                    return self.campaign().await;
                }
                Ok(Vec::new())
            }
        }
    }

    async fn campaign(&mut self) -> Result<Vec<Outbound>> {
        let term = self.log.term() + 1;
        self.log.set_term(term, Some(self.id)).await?;
        self.reset_election_timer();

        let mut votes = BTreeSet::new();
        votes.insert(self.id);
        self.role = Role::Candidate { votes };
        info!(id = self.id, term, "campaigning for pd leadership");

        if 1 >= self.quorum() {
            return self.become_leader().await;
        }

        let last_index = self.log.last_index();
        let last_term = self.log.last_term();
        Ok(self
            .peers
            .iter()
            .map(|peer| Outbound {
                to: *peer,
                request: RaftRequest::Vote {
                    term,
                    candidate: self.id,
                    last_index,
                    last_term,
                },
            })
            .collect())
    }

    async fn become_leader(&mut self) -> Result<Vec<Outbound>> {
        let term = self.log.term();
        let next = self.log.last_index() + 1;
        self.role = Role::Leader {
            next_index: self.peers.iter().map(|p| (*p, next)).collect(),
            match_index: self.peers.iter().map(|p| (*p, 0)).collect(),
        };
        self.heartbeat_elapsed = 0;
        info!(id = self.id, term, "won pd leadership");

        // Commit entries from previous terms by appending an entry in the
        // new term (Raft §5.4.2). Empty commands are skipped on apply.
        let noop = LogEntry {
            index: next,
            term,
            command: Vec::new(),
        };
        self.log.append(vec![noop]).await?;
        self.maybe_commit();

        Ok(self.broadcast_appends())
    }

    async fn step_down(&mut self, term: u64, leader: Option<NodeId>) -> Result<()> {
        if term > self.log.term() {
            self.log.set_term(term, None).await?;
        }
        if self.is_leader() {
            info!(id = self.id, term, "stepping down from pd leadership");
        }
        self.role = Role::Follower { leader };
        self.reset_election_timer();
        Ok(())
    }

    fn reset_election_timer(&mut self) {
        self.election_elapsed = 0;
        self.election_timeout = rand::thread_rng().gen_range(ELECTION_TIMEOUT_TICKS);
    }

    fn broadcast_appends(&self) -> Vec<Outbound> {
        let Role::Leader { next_index, .. } = &self.role else {
            return Vec::new();
        };
        next_index
            .iter()
            .map(|(peer, next)| Outbound {
                to: *peer,
                request: self.append_request(*next),
            })
            .collect()
    }

    fn append_request(&self, next: u64) -> RaftRequest {
        let base_index = next - 1;
        let base_term = self.log.term_at(base_index).unwrap_or(0);
        RaftRequest::Append {
            term: self.log.term(),
            leader: self.id,
            base_index,
            base_term,
            entries: self.log.entries_from(next, MAX_APPEND_ENTRIES),
            commit_index: self.commit_index,
        }
    }

    /// Handle an inbound request from a peer.
    pub async fn handle_request(&mut self, request: RaftRequest) -> Result<RaftResponse> {
        match request {
            RaftRequest::Vote {
                term,
                candidate,
                last_index,
                last_term,
            } => self.handle_vote(term, candidate, last_index, last_term).await,
            RaftRequest::Append {
                term,
                leader,
                base_index,
                base_term,
                entries,
                commit_index,
            } => {
                self.handle_append(term, leader, base_index, base_term, entries, commit_index)
                    .await
            }
        }
    }

    async fn handle_vote(
        &mut self,
        term: u64,
        candidate: NodeId,
        last_index: u64,
        last_term: u64,
    ) -> Result<RaftResponse> {
        if term > self.log.term() {
            self.step_down(term, None).await?;
        }

        let up_to_date = (last_term, last_index) >= (self.log.last_term(), self.log.last_index());
        let granted = term == self.log.term()
            && up_to_date
            && (self.log.voted_for().is_none() || self.log.voted_for() == Some(candidate));

        if granted {
            if self.log.voted_for().is_none() {
                self.log.set_term(term, Some(candidate)).await?;
            }
            self.reset_election_timer();
            debug!(id = self.id, term, candidate, "granted vote");
        }

        Ok(RaftResponse::Vote {
            term: self.log.term(),
            granted,
        })
    }

    async fn handle_append(
        &mut self,
        term: u64,
        leader: NodeId,
        base_index: u64,
        base_term: u64,
        entries: Vec<LogEntry>,
        commit_index: u64,
    ) -> Result<RaftResponse> {
        if term < self.log.term() {
            return Ok(RaftResponse::Append {
                term: self.log.term(),
                success: false,
                last_index: self.log.last_index(),
            });
        }

        // A current or newer leader: follow it.
        self.step_down(term, Some(leader)).await?;

        if !self.log.has(base_index, base_term) {
            return Ok(RaftResponse::Append {
                term: self.log.term(),
                success: false,
                last_index: self.log.last_index(),
            });
        }

        self.log.splice(entries).await?;
        let last_index = self.log.last_index();
        if commit_index > self.commit_index {
            self.commit_index = commit_index.min(last_index);
        }

        Ok(RaftResponse::Append {
            term: self.log.term(),
            success: true,
            last_index,
        })
    }

    /// Handle a response to one of our outbound messages.
    pub async fn handle_response(
        &mut self,
        from: NodeId,
        response: RaftResponse,
    ) -> Result<Vec<Outbound>> {
        match response {
            RaftResponse::Vote { term, granted } => {
                if term > self.log.term() {
                    self.step_down(term, None).await?;
                    return Ok(Vec::new());
                }
                let quorum = self.quorum();
                let current_term = self.log.term();
                let won = if let Role::Candidate { votes } = &mut self.role {
                    granted && term == current_term && {
                        votes.insert(from);
                        votes.len() >= quorum
                    }
                } else {
                    false
                };
                if won {
                    return self.become_leader().await;
                }
                Ok(Vec::new())
            }
            RaftResponse::Append {
                term,
                success,
                last_index,
            } => {
                if term > self.log.term() {
                    self.step_down(term, None).await?;
                    return Ok(Vec::new());
                }
                if term != self.log.term() {
                    return Ok(Vec::new());
                }
                let log_end = self.log.last_index();
                if success {
                    {
                        let Role::Leader {
                            next_index,
                            match_index,
                        } = &mut self.role
                        else {
                            return Ok(Vec::new());
                        };
                        let matched = match_index.entry(from).or_insert(0);
                        *matched = (*matched).max(last_index);
                        next_index.insert(from, last_index + 1);
                    }
                    self.maybe_commit();
                    if last_index < log_end {
                        // Keep shipping the rest of the log.
                        Ok(vec![Outbound {
                            to: from,
                            request: self.append_request(last_index + 1),
                        }])
                    } else {
                        Ok(Vec::new())
                    }
                } else {
                    // Back off towards the follower's log end and retry.
                    let next = {
                        let Role::Leader { next_index, .. } = &mut self.role else {
                            return Ok(Vec::new());
                        };
                        let next = next_index.entry(from).or_insert(1);
                        *next = (*next - 1).clamp(1, last_index + 1);
                        *next
                    };
                    Ok(vec![Outbound {
                        to: from,
                        request: self.append_request(next),
                    }])
                }
            }
        }
    }

    /// Propose a command. Leader only; returns the assigned log index and
    /// the replication messages to send.
    pub async fn propose(&mut self, command: Vec<u8>) -> Result<(u64, Vec<Outbound>)> {
        if !self.is_leader() {
            return Err(Error::Unavailable(match self.leader_hint() {
                Some(leader) => format!("not the pd leader; try pd node {leader}"),
                None => "no pd leader elected".to_string(),
            }));
        }

        let index = self.log.last_index() + 1;
        let entry = LogEntry {
            index,
            term: self.log.term(),
            command,
        };
        self.log.append(vec![entry]).await?;
        self.maybe_commit();
        self.heartbeat_elapsed = 0;
        Ok((index, self.broadcast_appends()))
    }

    /// Advance the commit index to the highest quorum-replicated entry of
    /// the current term.
    fn maybe_commit(&mut self) {
        let Role::Leader { match_index, .. } = &self.role else {
            return;
        };
        let mut acked: Vec<u64> = match_index.values().copied().collect();
        acked.push(self.log.last_index());
        acked.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = acked[self.quorum() - 1];
        if candidate > self.commit_index
            && self.log.term_at(candidate) == Some(self.log.term())
        {
            debug!(id = self.id, commit = candidate, "commit index advanced");
            self.commit_index = candidate;
        }
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    /// The next committed-but-unapplied entry, advancing the applied
    /// cursor. The driver calls this in a loop after every event.
    pub fn next_unapplied(&mut self) -> Option<LogEntry> {
        if self.applied_index >= self.commit_index {
            return None;
        }
        self.applied_index += 1;
        self.log.entry(self.applied_index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn core(id: NodeId, peers: Vec<NodeId>, dir: &std::path::Path) -> RaftCore {
        let log = RaftLog::open(&dir.join(format!("pd-{id}"))).await.unwrap();
        RaftCore::new(id, peers, log)
    }

    async fn tick_until_campaign(core: &mut RaftCore) -> Vec<Outbound> {
        for _ in 0..ELECTION_TIMEOUT_TICKS.end {
            let out = core.tick().await.unwrap();
            if !out.is_empty() || core.is_leader() {
                return out;
            }
        }
        panic!("no campaign within the election timeout range");
    }

    #[tokio::test]
    async fn single_node_elects_itself_and_commits() {
        let dir = tempfile::tempdir().unwrap();
        let mut node = core(0, vec![], dir.path()).await;

        tick_until_campaign(&mut node).await;
        assert!(node.is_leader());
        assert_eq!(node.leader_hint(), Some(0));

        // The no-op from the election is already committed.
        assert_eq!(node.commit_index(), 1);
        assert!(node.next_unapplied().unwrap().command.is_empty());

        let (index, out) = node.propose(b"cmd".to_vec()).await.unwrap();
        assert_eq!(index, 2);
        assert!(out.is_empty());
        assert_eq!(node.commit_index(), 2);
        assert_eq!(node.next_unapplied().unwrap().command, b"cmd");
        assert!(node.next_unapplied().is_none());
    }

    #[tokio::test]
    async fn vote_is_granted_once_per_term() {
        let dir = tempfile::tempdir().unwrap();
        let mut follower = core(0, vec![1, 2], dir.path()).await;

        let resp = follower
            .handle_request(RaftRequest::Vote {
                term: 1,
                candidate: 1,
                last_index: 0,
                last_term: 0,
            })
            .await
            .unwrap();
        assert_eq!(
            resp,
            RaftResponse::Vote {
                term: 1,
                granted: true
            }
        );

        // A competing candidate in the same term is refused.
        let resp = follower
            .handle_request(RaftRequest::Vote {
                term: 1,
                candidate: 2,
                last_index: 0,
                last_term: 0,
            })
            .await
            .unwrap();
        assert_eq!(
            resp,
            RaftResponse::Vote {
                term: 1,
                granted: false
            }
        );

        // The same candidate asking again keeps its vote.
        let resp = follower
            .handle_request(RaftRequest::Vote {
                term: 1,
                candidate: 1,
                last_index: 0,
                last_term: 0,
            })
            .await
            .unwrap();
        assert_eq!(
            resp,
            RaftResponse::Vote {
                term: 1,
                granted: true
            }
        );
    }

    #[tokio::test]
    async fn vote_denied_to_stale_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut follower = core(0, vec![1, 2], dir.path()).await;

        // Give the follower an entry the candidate lacks.
        follower
            .handle_request(RaftRequest::Append {
                term: 1,
                leader: 2,
                base_index: 0,
                base_term: 0,
                entries: vec![LogEntry {
                    index: 1,
                    term: 1,
                    command: b"x".to_vec(),
                }],
                commit_index: 0,
            })
            .await
            .unwrap();

        let resp = follower
            .handle_request(RaftRequest::Vote {
                term: 2,
                candidate: 1,
                last_index: 0,
                last_term: 0,
            })
            .await
            .unwrap();
        assert_eq!(
            resp,
            RaftResponse::Vote {
                term: 2,
                granted: false
            }
        );
    }

    #[tokio::test]
    async fn three_node_election_and_replication() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = core(0, vec![1, 2], dir.path()).await;
        let mut b = core(1, vec![0, 2], dir.path()).await;

        // A campaigns; B grants.
        let out = tick_until_campaign(&mut a).await;
        assert_eq!(out.len(), 2);
        let vote_req = out
            .iter()
            .find(|o| o.to == 1)
            .map(|o| o.request.clone())
            .unwrap();
        let resp = b.handle_request(vote_req).await.unwrap();
        let out = a.handle_response(1, resp).await.unwrap();
        assert!(a.is_leader(), "one grant plus self is a quorum of 3");

        // Leadership was announced with appends carrying the no-op.
        let append = out.into_iter().find(|o| o.to == 1).unwrap();
        let resp = b.handle_request(append.request).await.unwrap();
        let _ = a.handle_response(1, resp).await.unwrap();
        assert_eq!(a.commit_index(), 1);

        // Propose and replicate to B: quorum of 2 commits.
        let (index, out) = a.propose(b"hello".to_vec()).await.unwrap();
        let append = out.into_iter().find(|o| o.to == 1).unwrap();
        let resp = b.handle_request(append.request).await.unwrap();
        let _ = a.handle_response(1, resp).await.unwrap();
        assert_eq!(a.commit_index(), index);

        // B learns the commit index on the next heartbeat.
        let out = a.tick().await.unwrap();
        let append = out.into_iter().find(|o| o.to == 1).unwrap();
        b.handle_request(append.request).await.unwrap();
        assert_eq!(b.commit_index(), index);

        // Drain applies on B: no-op first, then the command.
        assert!(b.next_unapplied().unwrap().command.is_empty());
        assert_eq!(b.next_unapplied().unwrap().command, b"hello");
    }

    #[tokio::test]
    async fn stale_leader_append_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut follower = core(0, vec![1, 2], dir.path()).await;
        follower.log.set_term(5, None).await.unwrap();

        let resp = follower
            .handle_request(RaftRequest::Append {
                term: 3,
                leader: 1,
                base_index: 0,
                base_term: 0,
                entries: vec![],
                commit_index: 0,
            })
            .await
            .unwrap();
        assert_eq!(
            resp,
            RaftResponse::Append {
                term: 5,
                success: false,
                last_index: 0
            }
        );
    }

    #[tokio::test]
    async fn lagging_follower_is_probed_back_and_caught_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut leader = core(0, vec![1, 2], dir.path()).await;
        let mut follower = core(1, vec![0, 2], dir.path()).await;

        // Seed the future leader's log from a previous term's leader.
        leader
            .handle_request(RaftRequest::Append {
                term: 1,
                leader: 2,
                base_index: 0,
                base_term: 0,
                entries: (1..=3)
                    .map(|i| LogEntry {
                        index: i,
                        term: 1,
                        command: vec![i as u8],
                    })
                    .collect(),
                commit_index: 0,
            })
            .await
            .unwrap();

        // Elect it with C's (simulated) vote. next_index for the empty
        // follower starts past the follower's log end.
        let out = tick_until_campaign(&mut leader).await;
        assert!(!out.is_empty());
        let term = leader.term();
        let _ = leader
            .handle_response(2, RaftResponse::Vote {
                term,
                granted: true,
            })
            .await
            .unwrap();
        assert!(leader.is_leader());

        // Drive leader<->follower until the logs match: the first append is
        // rejected (base entry missing) and the follower's log-end hint
        // walks next_index back, then everything ships.
        let mut pending: Vec<Outbound> = leader
            .tick()
            .await
            .unwrap()
            .into_iter()
            .filter(|o| o.to == 1)
            .collect();
        let mut rounds = 0;
        let mut saw_rejection = false;
        while let Some(out) = pending.pop() {
            rounds += 1;
            assert!(rounds < 32, "probe did not converge");
            let resp = follower.handle_request(out.request).await.unwrap();
            if matches!(resp, RaftResponse::Append { success: false, .. }) {
                saw_rejection = true;
            }
            pending = leader
                .handle_response(1, resp)
                .await
                .unwrap()
                .into_iter()
                .filter(|o| o.to == 1)
                .collect();
        }
        assert!(saw_rejection, "expected at least one probe rejection");
        assert_eq!(follower.log.last_index(), leader.log.last_index());
        assert_eq!(follower.log.last_term(), leader.log.last_term());
    }
}
