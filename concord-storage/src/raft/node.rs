use std::collections::HashSet;
use std::sync::Arc;

use concord_common::error::{ConcordError, Result};
use concord_common::metrics::{MetricsCollector, NoopMetrics};
use concord_common::types::{ClusterConfig, LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::log::RaftLog;
use super::metadata::MetadataStore;
use super::role::{NodeRole, Role};
use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, Outbound, Request, RequestVoteRequest,
    RequestVoteResponse,
};
use super::snapshot::{IncomingSnapshot, SnapshotStorage};
use super::state_machine::StateMachine;
use super::storage::NodeStorage;

/// Tuning that only affects the local node.
#[derive(Debug, Clone, PartialEq)]
pub struct RaftOptions {
    /// Retained entries allowed before the log is compacted
    pub snapshot_threshold: u64,
    /// Upper bound on entries carried by one AppendEntries
    pub max_entries_per_append: usize,
    /// Upper bound on image bytes carried by one InstallSnapshot
    pub snapshot_chunk_bytes: usize,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            snapshot_threshold: 1_000,
            max_entries_per_append: 64,
            snapshot_chunk_bytes: 1024 * 1024,
        }
    }
}

impl From<&ClusterConfig> for RaftOptions {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            snapshot_threshold: config.snapshot_threshold,
            max_entries_per_append: config.max_entries_per_append,
            snapshot_chunk_bytes: config.snapshot_chunk_bytes,
        }
    }
}

/// A committed entry that has just been applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub index: LogIndex,
    pub term: Term,
    pub result: Vec<u8>,
}

/// Side effects accumulated since the last [`RaftNode::take_ready`].
#[derive(Debug, Default)]
pub struct Ready {
    pub messages: Vec<Outbound>,
    pub applied: Vec<Applied>,
    /// A leader was heard from, a vote was granted, or an election started
    pub reset_election_timer: bool,
}

/// Point-in-time view of a node, for operators and tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub term: Term,
    pub leader_hint: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub snapshot_index: LogIndex,
    pub halted: bool,
}

/// A Raft node: controls its own state and participates in consensus.
///
/// All state lives here and is only touched through `&mut self`, so whoever
/// owns the node is its serialization point. The node never does I/O on the
/// network itself; requests it wants sent and entries it applied are queued
/// and handed out by [`RaftNode::take_ready`].
///
/// A failed durable write halts the node for good: every later call returns
/// [`ConcordError::Halted`].
pub struct RaftNode<S: StateMachine> {
    pub(crate) id: NodeId,
    pub(crate) peers: Vec<NodeId>,
    pub(crate) role: Role,
    pub(crate) meta: MetadataStore,
    pub(crate) log: RaftLog,
    pub(crate) snapshots: Box<dyn SnapshotStorage>,
    pub(crate) state_machine: S,
    pub(crate) commit_index: LogIndex,
    pub(crate) last_applied: LogIndex,
    pub(crate) opts: RaftOptions,
    pub(crate) ready: Ready,
    pub(crate) halted: bool,
    pub(crate) incoming_snapshot: Option<IncomingSnapshot>,
    pub(crate) metrics: Arc<dyn MetricsCollector>,
}

impl<S: StateMachine> RaftNode<S> {
    /// Create a Raft node over existing (possibly empty) storage.
    ///
    /// Recovers term and vote from the metadata store and, if a snapshot
    /// exists, restores the state machine from it. Entries after the
    /// snapshot are re-applied once a leader confirms they are committed.
    pub fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        storage: NodeStorage,
        mut state_machine: S,
        opts: RaftOptions,
    ) -> Result<Self> {
        let NodeStorage {
            mut log,
            metadata,
            snapshots,
        } = storage;

        let mut applied = 0;
        match snapshots.load()? {
            Some(snapshot) => {
                if log.snapshot_index() > snapshot.last_included_index {
                    return Err(ConcordError::Consensus(format!(
                        "log compacted through {} but snapshot only covers {}",
                        log.snapshot_index(),
                        snapshot.last_included_index
                    )));
                }
                state_machine.restore(&snapshot.state)?;
                let (index, term) = (snapshot.last_included_index, snapshot.last_included_term);
                // a crash during an install can leave a stale log behind the snapshot
                if log.term_at(index) == Some(term) {
                    log.compact_to(index, term)?;
                } else {
                    warn!(node = %id, index, term, "log disagrees with snapshot, discarding it");
                    log.reset_to_snapshot(index, term)?;
                }
                applied = index;
            }
            None if log.snapshot_index() > 0 => {
                return Err(ConcordError::Consensus(format!(
                    "log compacted through {} but no snapshot found",
                    log.snapshot_index()
                )));
            }
            None => {}
        }

        let peers: Vec<NodeId> = peers.into_iter().filter(|p| *p != id).collect();
        info!(
            node = %id,
            term = metadata.current_term(),
            last_log_index = log.last_index(),
            snapshot_index = applied,
            peers = peers.len(),
            "raft node starting"
        );

        Ok(Self {
            id,
            peers,
            role: Role::Follower { leader_hint: None },
            meta: metadata,
            log,
            snapshots,
            state_machine,
            commit_index: applied,
            last_applied: applied,
            opts,
            ready: Ready::default(),
            halted: false,
            incoming_snapshot: None,
            metrics: Arc::new(NoopMetrics),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub fn current_term(&self) -> Term {
        self.meta.current_term()
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.meta.voted_for()
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn node_role(&self) -> NodeRole {
        self.role.kind()
    }

    pub fn is_leader(&self) -> bool {
        self.role.kind() == NodeRole::Leader
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    pub fn state_machine(&self) -> &S {
        &self.state_machine
    }

    /// Who this node believes is leading, if anyone
    pub fn leader_hint(&self) -> Option<NodeId> {
        match &self.role {
            Role::Follower { leader_hint } => leader_hint.clone(),
            Role::Candidate { .. } => None,
            Role::Leader(_) => Some(self.id.clone()),
        }
    }

    /// Votes needed to win an election or commit an entry, self included
    pub fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.id.clone(),
            role: self.role.kind(),
            term: self.current_term(),
            leader_hint: self.leader_hint(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
            snapshot_index: self.log.snapshot_index(),
            halted: self.halted,
        }
    }

    /// Drains everything produced since the previous call
    pub fn take_ready(&mut self) -> Ready {
        std::mem::take(&mut self.ready)
    }

    /// Election timer fired: campaign for the next term. Ignored by leaders.
    pub fn start_election(&mut self) -> Result<()> {
        self.ensure_running()?;
        let result = self.campaign();
        self.check(result)
    }

    /// Handles RequestVote from a candidate, in any role.
    pub fn handle_request_vote(&mut self, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        self.ensure_running()?;
        let result = self.on_request_vote(req);
        self.check(result)
    }

    /// Handles a vote reply to a RequestVote sent in `request_term`.
    pub fn handle_vote_response(
        &mut self,
        from: &str,
        request_term: Term,
        resp: RequestVoteResponse,
    ) -> Result<()> {
        self.ensure_running()?;
        let result = self.on_vote_response(from, request_term, resp);
        self.check(result)
    }

    /// Handles AppendEntries from a leader, in any role.
    pub fn handle_append_entries(
        &mut self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.ensure_running()?;
        let result = self.on_append_entries(req);
        self.check(result)
    }

    /// Appends a client command to the leader's log and starts replicating it.
    ///
    /// Returns the index the command will occupy once committed.
    pub fn propose(&mut self, command: Vec<u8>) -> Result<LogIndex> {
        self.ensure_running()?;
        if !self.is_leader() {
            return Err(ConcordError::NotLeader {
                leader_hint: self.leader_hint(),
            });
        }
        let result = self.append_and_replicate(command);
        self.check(result)
    }

    fn append_and_replicate(&mut self, command: Vec<u8>) -> Result<LogIndex> {
        let index = self.log.append_command(self.current_term(), command)?;
        debug!(node = %self.id, index, "appended client command");

        // a lone node is its own majority
        self.advance_commit_index()?;
        for peer in self.peers.clone() {
            self.replicate_to(&peer)?;
        }
        Ok(index)
    }

    fn campaign(&mut self) -> Result<()> {
        if self.is_leader() {
            return Ok(());
        }

        let term = self.current_term() + 1;
        self.meta.update(term, Some(self.id.clone()))?;

        let mut votes_received = HashSet::new();
        votes_received.insert(self.id.clone());
        self.set_role(Role::Candidate { votes_received });
        self.ready.reset_election_timer = true;
        self.metrics.inc_counter("elections_started");
        self.metrics.observe_gauge("term", term as f64);
        info!(node = %self.id, term, "starting election");

        if self.quorum() == 1 {
            return self.become_leader();
        }

        let req = RequestVoteRequest {
            term,
            candidate_id: self.id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for peer in self.peers.clone() {
            self.send(&peer, Request::RequestVote(req.clone()));
        }
        Ok(())
    }

    fn on_request_vote(&mut self, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        self.observe_term(req.term)?;
        let term = self.current_term();
        let deny = RequestVoteResponse {
            term,
            vote_granted: false,
        };

        if req.term < term {
            return Ok(deny);
        }

        let log_ok = (req.last_log_term, req.last_log_index)
            >= (self.log.last_term(), self.log.last_index());
        let free = match self.meta.voted_for() {
            None => true,
            Some(v) => *v == req.candidate_id,
        };
        if !log_ok || !free {
            debug!(
                node = %self.id,
                term,
                candidate = %req.candidate_id,
                log_ok,
                "vote denied"
            );
            return Ok(deny);
        }

        // durable before the grant leaves this node
        if self.meta.voted_for().is_none() {
            self.meta.set_voted_for(Some(req.candidate_id.clone()))?;
        }
        self.ready.reset_election_timer = true;
        debug!(node = %self.id, term, candidate = %req.candidate_id, "vote granted");
        Ok(RequestVoteResponse {
            term,
            vote_granted: true,
        })
    }

    fn on_vote_response(
        &mut self,
        from: &str,
        request_term: Term,
        resp: RequestVoteResponse,
    ) -> Result<()> {
        if self.observe_term(resp.term)? {
            return Ok(());
        }
        if request_term != self.current_term() || !self.peers.iter().any(|p| p == from) {
            return Ok(());
        }

        let quorum = self.quorum();
        let won = match &mut self.role {
            Role::Candidate { votes_received } if resp.vote_granted => {
                votes_received.insert(from.to_string());
                votes_received.len() >= quorum
            }
            _ => false,
        };
        if won {
            self.become_leader()?;
        }
        Ok(())
    }

    fn on_append_entries(&mut self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.observe_term(req.term)?;
        let term = self.current_term();

        // 1. Reject if term is older
        if req.term < term {
            return Ok(AppendEntriesResponse::rejected(term));
        }
        if self.is_leader() {
            error!(node = %self.id, term, other = %req.leader_id, "second leader in term");
            return Err(ConcordError::Consensus(format!(
                "{} also claims leadership of term {term}",
                req.leader_id
            )));
        }

        // 2. Recognize the leader
        self.become_follower(Some(req.leader_id.clone()));
        self.ready.reset_election_timer = true;

        // 3. Validate previous entry consistency
        if req.prev_log_index > self.log.last_index() {
            return Ok(AppendEntriesResponse {
                conflict_index: Some(self.log.last_index() + 1),
                ..AppendEntriesResponse::rejected(term)
            });
        }
        // below the snapshot everything is committed and therefore matches
        if req.prev_log_index >= self.log.snapshot_index() {
            let local = self.log.term_at(req.prev_log_index).unwrap_or(0);
            if local != req.prev_log_term {
                return Ok(AppendEntriesResponse {
                    conflict_index: Some(self.log.first_index_of_term(local, req.prev_log_index)),
                    conflict_term: Some(local),
                    ..AppendEntriesResponse::rejected(term)
                });
            }
        }

        // 4. Append new entries, truncating at the first conflict
        let last_new = req.summary().last_index();
        let mut fresh = Vec::new();
        for entry in req.entries {
            if entry.index <= self.log.snapshot_index() {
                continue;
            }
            if !fresh.is_empty() {
                fresh.push(entry);
                continue;
            }
            match self.log.term_at(entry.index) {
                Some(existing) if existing == entry.term => {}
                Some(existing) => {
                    if entry.index <= self.commit_index {
                        return Err(ConcordError::Consensus(format!(
                            "leader {} conflicts with committed entry {}",
                            req.leader_id, entry.index
                        )));
                    }
                    warn!(
                        node = %self.id,
                        index = entry.index,
                        existing,
                        incoming = entry.term,
                        "truncating conflicting suffix"
                    );
                    self.log.truncate_from(entry.index)?;
                    fresh.push(entry);
                }
                None => fresh.push(entry),
            }
        }
        self.log.append(fresh)?;

        // 5. Update commit index
        if req.leader_commit > self.commit_index {
            let commit = req.leader_commit.min(last_new);
            if commit > self.commit_index {
                self.commit_index = commit;
                self.metrics.observe_gauge("commit_index", commit as f64);
            }
        }
        self.apply_committed()?;

        Ok(AppendEntriesResponse::accepted(term))
    }

    /// Adopts `term` if it is newer than ours, stepping down to follower.
    /// Returns whether the term changed.
    pub(crate) fn observe_term(&mut self, term: Term) -> Result<bool> {
        let current = self.current_term();
        if term <= current {
            return Ok(false);
        }
        self.meta.set_term(term)?;
        info!(node = %self.id, from = current, to = term, "observed newer term");
        self.become_follower(None);
        self.metrics.observe_gauge("term", term as f64);
        Ok(true)
    }

    pub(crate) fn become_follower(&mut self, leader_hint: Option<NodeId>) {
        self.set_role(Role::Follower { leader_hint });
    }

    pub(crate) fn set_role(&mut self, role: Role) {
        let from = self.role.kind();
        let to = role.kind();
        debug_assert!(from.can_become(to), "illegal transition {from} -> {to}");
        if from != to {
            info!(node = %self.id, term = self.current_term(), %from, %to, "role change");
        }
        self.role = role;
    }

    pub(crate) fn send(&mut self, to: &str, request: Request) {
        self.ready.messages.push(Outbound {
            to: to.to_string(),
            request,
        });
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.halted {
            return Err(ConcordError::Halted);
        }
        Ok(())
    }

    /// Halts the node if `result` is a persistence failure.
    pub(crate) fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() && !self.halted {
                error!(node = %self.id, error = %e, "durable write failed, halting node");
                self.halted = true;
                self.ready = Ready::default();
            }
        }
        result
    }
}

//
// 🧪 Unit Tests
//
#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::log::LogEntry;
    use crate::raft::state_machine::{KeyValueStore, KvCommand};

    fn test_node(id: &str) -> RaftNode<KeyValueStore> {
        RaftNode::new(
            id.into(),
            vec!["node1".into(), "node2".into(), "node3".into()],
            NodeStorage::in_memory(),
            KeyValueStore::default(),
            RaftOptions::default(),
        )
        .unwrap()
    }

    fn vote_request(term: Term, candidate: &str, last_index: LogIndex, last_term: Term) -> RequestVoteRequest {
        RequestVoteRequest {
            term,
            candidate_id: candidate.into(),
            last_log_index: last_index,
            last_log_term: last_term,
        }
    }

    fn heartbeat(term: Term, leader: &str) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term,
            leader_id: leader.into(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        }
    }

    #[test]
    fn test_peers_exclude_self() {
        let node = test_node("node1");
        assert_eq!(node.peers(), &["node2".to_string(), "node3".to_string()]);
        assert_eq!(node.quorum(), 2);
    }

    #[test]
    fn test_start_election_votes_for_self() {
        let mut node = test_node("node1");
        node.start_election().unwrap();

        assert_eq!(node.node_role(), NodeRole::Candidate);
        assert_eq!(node.current_term(), 1);
        assert_eq!(node.voted_for(), Some(&"node1".to_string()));

        let ready = node.take_ready();
        assert!(ready.reset_election_timer);
        assert_eq!(ready.messages.len(), 2);
        assert!(ready
            .messages
            .iter()
            .all(|m| matches!(&m.request, Request::RequestVote(r) if r.term == 1)));
    }

    #[test]
    fn test_become_leader_on_majority_votes() {
        let mut node = test_node("node1");
        node.start_election().unwrap();
        let term = node.current_term();

        node.handle_vote_response("node2", term, RequestVoteResponse { term, vote_granted: true })
            .unwrap();

        assert!(node.is_leader());
        // authority is asserted right away with empty AppendEntries
        let ready = node.take_ready();
        let heartbeats = ready
            .messages
            .iter()
            .filter(|m| matches!(&m.request, Request::AppendEntries(r) if r.is_heartbeat()))
            .count();
        assert_eq!(heartbeats, 2);
    }

    #[test]
    fn test_duplicate_votes_count_once() {
        let mut node = RaftNode::new(
            "n1".into(),
            (1..=5).map(|i| format!("n{i}")).collect(),
            NodeStorage::in_memory(),
            KeyValueStore::default(),
            RaftOptions::default(),
        )
        .unwrap();
        node.start_election().unwrap();
        let grant = RequestVoteResponse { term: 1, vote_granted: true };

        node.handle_vote_response("n2", 1, grant.clone()).unwrap();
        node.handle_vote_response("n2", 1, grant.clone()).unwrap();
        assert_eq!(node.node_role(), NodeRole::Candidate);

        node.handle_vote_response("n3", 1, grant).unwrap();
        assert!(node.is_leader());
    }

    #[test]
    fn test_votes_from_old_election_are_ignored() {
        let mut node = test_node("node1");
        node.start_election().unwrap();
        node.start_election().unwrap();
        assert_eq!(node.current_term(), 2);

        node.handle_vote_response("node2", 1, RequestVoteResponse { term: 1, vote_granted: true })
            .unwrap();
        assert_eq!(node.node_role(), NodeRole::Candidate);
    }

    #[test]
    fn test_step_down_on_higher_term_vote() {
        let mut node = test_node("node1");
        node.start_election().unwrap();

        node.handle_vote_response("node2", 1, RequestVoteResponse { term: 2, vote_granted: false })
            .unwrap();

        assert_eq!(node.node_role(), NodeRole::Follower);
        assert_eq!(node.current_term(), 2);
        assert_eq!(node.voted_for(), None);
    }

    #[test]
    fn test_grants_one_vote_per_term() {
        let mut node = test_node("node1");

        let first = node.handle_request_vote(vote_request(1, "node2", 0, 0)).unwrap();
        assert!(first.vote_granted);
        assert!(node.take_ready().reset_election_timer);

        let again = node.handle_request_vote(vote_request(1, "node2", 0, 0)).unwrap();
        assert!(again.vote_granted);

        let other = node.handle_request_vote(vote_request(1, "node3", 0, 0)).unwrap();
        assert!(!other.vote_granted);

        // a newer term frees the vote
        let later = node.handle_request_vote(vote_request(2, "node3", 0, 0)).unwrap();
        assert!(later.vote_granted);
        assert_eq!(later.term, 2);
    }

    #[test]
    fn test_denies_candidate_with_stale_log() {
        let mut node = test_node("node1");
        node.handle_append_entries(AppendEntriesRequest {
            entries: vec![LogEntry::new(2, 1, vec![]), LogEntry::new(2, 2, vec![])],
            ..heartbeat(2, "node2")
        })
        .unwrap();

        // older last term loses even with a longer log
        let resp = node.handle_request_vote(vote_request(3, "node3", 5, 1)).unwrap();
        assert!(!resp.vote_granted);
        // same last term but shorter log loses
        let resp = node.handle_request_vote(vote_request(3, "node3", 1, 2)).unwrap();
        assert!(!resp.vote_granted);
        // equal log wins
        let resp = node.handle_request_vote(vote_request(3, "node3", 2, 2)).unwrap();
        assert!(resp.vote_granted);
    }

    #[test]
    fn test_denies_vote_for_lower_term() {
        let mut node = test_node("node1");
        node.handle_append_entries(heartbeat(4, "node2")).unwrap();

        let resp = node.handle_request_vote(vote_request(3, "node3", 9, 3)).unwrap();
        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 4);
    }

    #[test]
    fn test_handle_append_entries_heartbeat() {
        let mut node = test_node("node1");
        node.start_election().unwrap();

        let res = node.handle_append_entries(heartbeat(1, "node2")).unwrap();
        assert!(res.success);
        assert_eq!(res.term, 1);
        assert_eq!(node.node_role(), NodeRole::Follower);
        assert_eq!(node.leader_hint(), Some("node2".to_string()));
    }

    #[test]
    fn test_handle_append_entries_reject_stale_term() {
        let mut node = test_node("node1");
        node.handle_append_entries(heartbeat(2, "node2")).unwrap();
        node.take_ready();

        let res = node.handle_append_entries(heartbeat(1, "node3")).unwrap();
        assert!(!res.success);
        assert_eq!(res.term, 2);
        assert!(!node.take_ready().reset_election_timer);
    }

    #[test]
    fn test_append_entries_reports_short_log() {
        let mut node = test_node("node1");
        let res = node
            .handle_append_entries(AppendEntriesRequest {
                prev_log_index: 5,
                prev_log_term: 1,
                ..heartbeat(1, "node2")
            })
            .unwrap();

        assert!(!res.success);
        assert_eq!(res.conflict_index, Some(1));
        assert_eq!(res.conflict_term, None);
    }

    #[test]
    fn test_append_entries_reports_conflicting_term() {
        let mut node = test_node("node1");
        node.handle_append_entries(AppendEntriesRequest {
            entries: vec![
                LogEntry::new(1, 1, vec![]),
                LogEntry::new(2, 2, vec![]),
                LogEntry::new(2, 3, vec![]),
            ],
            ..heartbeat(2, "node2")
        })
        .unwrap();

        let res = node
            .handle_append_entries(AppendEntriesRequest {
                prev_log_index: 3,
                prev_log_term: 3,
                ..heartbeat(3, "node3")
            })
            .unwrap();
        assert!(!res.success);
        assert_eq!(res.conflict_term, Some(2));
        assert_eq!(res.conflict_index, Some(2));
    }

    #[test]
    fn test_conflicting_suffix_is_replaced() {
        let mut node = test_node("node1");
        node.handle_append_entries(AppendEntriesRequest {
            entries: vec![
                LogEntry::new(1, 1, b"a".to_vec()),
                LogEntry::new(1, 2, b"b".to_vec()),
                LogEntry::new(1, 3, b"c".to_vec()),
            ],
            ..heartbeat(1, "node2")
        })
        .unwrap();

        let res = node
            .handle_append_entries(AppendEntriesRequest {
                prev_log_index: 1,
                prev_log_term: 1,
                entries: vec![LogEntry::new(2, 2, b"x".to_vec())],
                ..heartbeat(2, "node3")
            })
            .unwrap();

        assert!(res.success);
        assert_eq!(node.log().last_index(), 2);
        assert_eq!(node.log().get(2).unwrap().command, b"x".to_vec());
    }

    #[test]
    fn test_duplicate_append_is_idempotent() {
        let mut node = test_node("node1");
        let req = AppendEntriesRequest {
            entries: vec![LogEntry::new(1, 1, b"a".to_vec()), LogEntry::new(1, 2, b"b".to_vec())],
            ..heartbeat(1, "node2")
        };
        node.handle_append_entries(req.clone()).unwrap();
        node.handle_append_entries(AppendEntriesRequest {
            prev_log_index: 2,
            prev_log_term: 1,
            entries: vec![LogEntry::new(1, 3, b"c".to_vec())],
            ..heartbeat(1, "node2")
        })
        .unwrap();

        // a delayed copy of the first request must not cut entry 3
        let res = node.handle_append_entries(req).unwrap();
        assert!(res.success);
        assert_eq!(node.log().last_index(), 3);
    }

    #[test]
    fn test_follower_commit_is_capped_by_last_new_entry() {
        let mut node = test_node("node1");
        let set = KvCommand::Set("key".into(), "value".into()).encode();
        node.handle_append_entries(AppendEntriesRequest {
            entries: vec![LogEntry::new(1, 1, set)],
            leader_commit: 10,
            ..heartbeat(1, "node2")
        })
        .unwrap();

        assert_eq!(node.commit_index(), 1);
        assert_eq!(node.last_applied(), 1);
        assert_eq!(node.state_machine().get("key"), Some("value".into()));
        assert_eq!(node.take_ready().applied.len(), 1);
    }

    #[test]
    fn test_propose_on_follower_returns_hint() {
        let mut node = test_node("node1");
        node.handle_append_entries(heartbeat(1, "node3")).unwrap();

        match node.propose(b"cmd".to_vec()) {
            Err(ConcordError::NotLeader { leader_hint }) => {
                assert_eq!(leader_hint, Some("node3".to_string()))
            }
            other => panic!("expected NotLeader, got {other:?}"),
        }
    }

    #[test]
    fn test_single_node_commits_alone() {
        let mut node = RaftNode::new(
            "solo".into(),
            vec!["solo".into()],
            NodeStorage::in_memory(),
            KeyValueStore::default(),
            RaftOptions::default(),
        )
        .unwrap();
        node.start_election().unwrap();
        assert!(node.is_leader());

        let index = node
            .propose(KvCommand::Set("k".into(), "v".into()).encode())
            .unwrap();
        assert_eq!(index, 1);
        assert_eq!(node.commit_index(), 1);
        assert_eq!(node.state_machine().get("k"), Some("v".into()));
    }

    #[test]
    fn test_persistence_failure_halts_node() {
        let dir = tempfile::tempdir().unwrap();
        let node_dir = dir.path().join("n1");
        let mut node = RaftNode::new(
            "node1".into(),
            vec!["node2".into(), "node3".into()],
            NodeStorage::open(&node_dir).unwrap(),
            KeyValueStore::default(),
            RaftOptions::default(),
        )
        .unwrap();

        std::fs::remove_dir_all(&node_dir).unwrap();

        let err = node.start_election().unwrap_err();
        assert!(err.is_fatal());
        assert!(node.is_halted());
        assert!(node.take_ready().messages.is_empty());

        // no more votes or acks
        assert!(matches!(
            node.handle_request_vote(vote_request(9, "node2", 0, 0)),
            Err(ConcordError::Halted)
        ));
        assert!(matches!(
            node.handle_append_entries(heartbeat(9, "node2")),
            Err(ConcordError::Halted)
        ));
    }

    #[test]
    fn test_restart_discards_log_that_disagrees_with_snapshot() {
        use crate::raft::snapshot::{RaftSnapshot, SnapshotStorage};
        use crate::raft::state_machine::StateMachine;

        let dir = tempfile::tempdir().unwrap();
        {
            // crashed after saving an installed snapshot, before the log rewrite
            let mut storage = NodeStorage::open(dir.path()).unwrap();
            let stale = (1..=5).map(|i| LogEntry::new(1, i, vec![])).collect();
            storage.log.append(stale).unwrap();
            storage.metadata.set_term(3).unwrap();
            let image = KeyValueStore::default().snapshot().unwrap();
            storage.snapshots.save(&RaftSnapshot::new(4, 3, image)).unwrap();
        }

        let open = || {
            RaftNode::new(
                "node1".into(),
                vec!["node2".into(), "node3".into()],
                NodeStorage::open(dir.path()).unwrap(),
                KeyValueStore::default(),
                RaftOptions::default(),
            )
            .unwrap()
        };
        let mut node = open();
        assert_eq!(node.log().snapshot_index(), 4);
        assert_eq!(node.log().last_index(), 4);
        assert_eq!(node.log().last_term(), 3);
        assert_eq!(node.last_applied(), 4);

        // a candidate missing the snapshotted entries must not win
        let resp = node
            .handle_request_vote(vote_request(4, "node2", 9, 2))
            .unwrap();
        assert!(!resp.vote_granted);

        drop(node);
        let node = open();
        assert_eq!(node.log().last_index(), 4);
        assert_eq!(node.log().last_term(), 3);
    }
}
