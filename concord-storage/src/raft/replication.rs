use concord_common::error::{ConcordError, Result};
use concord_common::types::{LogIndex, Term};
use tracing::{debug, info};

use super::node::RaftNode;
use super::role::{LeaderState, Role};
use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, AppendSummary, InstallSnapshotRequest, Request,
};
use super::state_machine::StateMachine;

impl<S: StateMachine> RaftNode<S> {
    /// Leader sends AppendEntries to every follower without a request in
    /// flight. Empty when the follower is caught up, i.e. a heartbeat.
    pub fn broadcast_heartbeat(&mut self) -> Result<()> {
        self.ensure_running()?;
        if !self.is_leader() {
            return Ok(());
        }
        let result = self.replicate_to_all();
        self.check(result)
    }

    /// Handles a follower's reply to the AppendEntries summarized by `sent`.
    pub fn handle_append_entries_response(
        &mut self,
        from: &str,
        sent: AppendSummary,
        resp: AppendEntriesResponse,
    ) -> Result<()> {
        self.ensure_running()?;
        let result = self.on_append_response(from, sent, resp);
        self.check(result)
    }

    /// A request to `from` sent in `term` timed out or failed to deliver.
    /// The next heartbeat retries it.
    pub fn handle_replication_failure(&mut self, from: &str, term: Term) {
        self.release(from, term);
    }

    /// Promote to leader — used when election is won
    pub(crate) fn become_leader(&mut self) -> Result<()> {
        let state = LeaderState::new(&self.peers, self.log.last_index());
        self.set_role(Role::Leader(state));
        self.metrics.inc_counter("leader_elected");
        info!(
            node = %self.id,
            term = self.current_term(),
            last_log_index = self.log.last_index(),
            "became leader"
        );

        // assert authority before taking client commands
        self.replicate_to_all()?;
        self.advance_commit_index()
    }

    fn replicate_to_all(&mut self) -> Result<()> {
        for peer in self.peers.clone() {
            self.replicate_to(&peer)?;
        }
        Ok(())
    }

    /// Queues the next AppendEntries (or InstallSnapshot, if the entries it
    /// needs were compacted away) for `peer`.
    pub(crate) fn replicate_to(&mut self, peer: &str) -> Result<()> {
        let (next, progress) = match self.role.leader_state() {
            Some(state) if !state.in_flight.contains(peer) => (
                state.next_for(peer),
                state.snapshot_progress.get(peer).copied(),
            ),
            _ => return Ok(()),
        };
        let term = self.current_term();

        let request = if next <= self.log.snapshot_index() {
            let Some(snapshot) = self.snapshots.load()? else {
                return Err(ConcordError::Consensus(format!(
                    "log compacted through {} but no snapshot to send",
                    self.log.snapshot_index()
                )));
            };
            let index = snapshot.last_included_index;
            // a newer snapshot restarts the transfer
            let offset = match progress {
                Some((sent, offset)) if sent == index => offset,
                _ => 0,
            };
            let size = snapshot.state.len();
            let start = (offset as usize).min(size);
            let end = start.saturating_add(self.opts.snapshot_chunk_bytes.max(1)).min(size);
            debug!(
                node = %self.id,
                peer,
                last_included_index = index,
                offset = start,
                size,
                "sending snapshot chunk"
            );
            if let Some(state) = self.role.leader_state_mut() {
                state
                    .snapshot_progress
                    .insert(peer.to_string(), (index, start as u64));
            }
            Request::InstallSnapshot(InstallSnapshotRequest {
                term,
                leader_id: self.id.clone(),
                last_included_index: index,
                last_included_term: snapshot.last_included_term,
                offset: start as u64,
                data: snapshot.state[start..end].to_vec(),
                done: end == size,
            })
        } else {
            let prev_log_index = next - 1;
            Request::AppendEntries(AppendEntriesRequest {
                term,
                leader_id: self.id.clone(),
                prev_log_index,
                prev_log_term: self.log.term_at(prev_log_index).unwrap_or(0),
                entries: self.log.entries_from(next, self.opts.max_entries_per_append),
                leader_commit: self.commit_index,
            })
        };

        if let Some(state) = self.role.leader_state_mut() {
            state.in_flight.insert(peer.to_string());
        }
        self.send(peer, request);
        Ok(())
    }

    fn on_append_response(
        &mut self,
        from: &str,
        sent: AppendSummary,
        resp: AppendEntriesResponse,
    ) -> Result<()> {
        self.release(from, sent.term);
        if self.observe_term(resp.term)? {
            return Ok(());
        }
        // replies to an earlier term's requests say nothing about this one
        if sent.term != self.current_term() || !self.is_leader() {
            return Ok(());
        }

        if resp.success {
            let next = self.record_match(from, sent.last_index());
            self.advance_commit_index()?;
            if next <= self.log.last_index() {
                self.replicate_to(from)?;
            }
            return Ok(());
        }

        let (next, matched) = match self.role.leader_state() {
            Some(state) => (state.next_for(from), state.match_for(from)),
            None => return Ok(()),
        };
        // only the reply to the probe at the current next_index moves it
        if sent.prev_log_index + 1 != next {
            return Ok(());
        }

        let backoff = self.backoff_target(sent.prev_log_index, &resp, matched);
        debug!(node = %self.id, peer = from, from_next = next, to_next = backoff, "backing off");
        if let Some(state) = self.role.leader_state_mut() {
            state.next_index.insert(from.to_string(), backoff);
        }
        self.replicate_to(from)
    }

    /// Where to probe next after a rejection of the request whose previous
    /// entry was `prev`. Always below `prev + 1` so probing makes progress.
    fn backoff_target(&self, prev: LogIndex, resp: &AppendEntriesResponse, matched: LogIndex) -> LogIndex {
        let hinted = match resp.conflict_term {
            Some(term) => self
                .log
                .last_index_of_term(term)
                .map(|i| i + 1)
                .or(resp.conflict_index),
            None => resp.conflict_index,
        };
        hinted.unwrap_or(prev).min(prev).max(matched + 1).max(1)
    }

    /// Raises `peer`'s match index to `index` (never lowers it) and returns
    /// the resulting next index.
    pub(crate) fn record_match(&mut self, peer: &str, index: LogIndex) -> LogIndex {
        let Some(state) = self.role.leader_state_mut() else {
            return 0;
        };
        let matched = state.match_index.entry(peer.to_string()).or_insert(0);
        *matched = (*matched).max(index);
        let matched = *matched;

        let next = state.next_index.entry(peer.to_string()).or_insert(1);
        *next = (*next).max(matched + 1);
        *next
    }

    pub(crate) fn release(&mut self, peer: &str, term: Term) {
        if term != self.current_term() {
            return;
        }
        if let Some(state) = self.role.leader_state_mut() {
            state.in_flight.remove(peer);
        }
    }
}
