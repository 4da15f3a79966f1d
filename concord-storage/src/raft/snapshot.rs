use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use concord_common::error::{ConcordError, Result};
use concord_common::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::durable::{read_optional, write_atomic};
use super::node::RaftNode;
use super::rpc::{InstallSnapshotRequest, InstallSnapshotResponse, SnapshotSummary};
use super::state_machine::StateMachine;

/// State machine image covering every entry up to `last_included_index`
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RaftSnapshot {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub state: Vec<u8>, // Serialized state machine data
    pub created_at: DateTime<Utc>,
}

impl RaftSnapshot {
    pub fn new(last_included_index: LogIndex, last_included_term: Term, state: Vec<u8>) -> Self {
        Self {
            last_included_index,
            last_included_term,
            state,
            created_at: Utc::now(),
        }
    }
}

/// Chunks of a leader's snapshot received so far. Two leaders may encode
/// the same state differently, so chunks only combine within one term.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingSnapshot {
    pub leader_term: Term,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub data: Vec<u8>,
}

/// Defines the behavior for any snapshot storage backend.
///
/// Only the latest snapshot is kept; `save` replaces it.
pub trait SnapshotStorage: Send {
    fn save(&mut self, snapshot: &RaftSnapshot) -> Result<()>;
    fn load(&self) -> Result<Option<RaftSnapshot>>;
}

/// Saves snapshots as a binary file.
pub struct FileSnapshotStorage {
    pub path: PathBuf,
}

impl FileSnapshotStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotStorage for FileSnapshotStorage {
    fn save(&mut self, snapshot: &RaftSnapshot) -> Result<()> {
        let encoded = bincode::serialize(snapshot)?;
        write_atomic(&self.path, &encoded).map_err(|e| ConcordError::persistence("write snapshot", e))
    }

    fn load(&self) -> Result<Option<RaftSnapshot>> {
        match read_optional(&self.path)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// Keeps the latest snapshot in memory only
#[derive(Debug, Default)]
pub struct MemorySnapshotStorage {
    latest: Option<RaftSnapshot>,
}

impl SnapshotStorage for MemorySnapshotStorage {
    fn save(&mut self, snapshot: &RaftSnapshot) -> Result<()> {
        self.latest = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<RaftSnapshot>> {
        Ok(self.latest.clone())
    }
}

pub fn snapshot_path(dir: &Path) -> PathBuf {
    dir.join("snapshot.bin")
}

impl<S: StateMachine> RaftNode<S> {
    /// Snapshots the state machine at `last_applied` and drops the log
    /// prefix it covers. Returns the new boundary, or `None` if nothing new
    /// was applied since the last snapshot.
    pub fn take_snapshot(&mut self) -> Result<Option<LogIndex>> {
        self.ensure_running()?;
        let result = self.snapshot_applied();
        self.check(result)
    }

    /// Handles InstallSnapshot from a leader, in any role.
    pub fn handle_install_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.ensure_running()?;
        let result = self.on_install_snapshot(req);
        self.check(result)
    }

    /// Handles a follower's reply to the InstallSnapshot chunk summarized
    /// by `sent`.
    pub fn handle_install_snapshot_response(
        &mut self,
        from: &str,
        sent: SnapshotSummary,
        resp: InstallSnapshotResponse,
    ) -> Result<()> {
        self.ensure_running()?;
        let result = self.on_install_snapshot_response(from, sent, resp);
        self.check(result)
    }

    /// Compacts once the retained log outgrows the configured threshold.
    pub(crate) fn maybe_compact(&mut self) -> Result<()> {
        if (self.log.len() as u64) <= self.opts.snapshot_threshold {
            return Ok(());
        }
        if self.last_applied <= self.log.snapshot_index() {
            return Ok(());
        }
        self.snapshot_applied().map(|_| ())
    }

    fn snapshot_applied(&mut self) -> Result<Option<LogIndex>> {
        let index = self.last_applied;
        if index <= self.log.snapshot_index() {
            return Ok(None);
        }
        let Some(term) = self.log.term_at(index) else {
            return Err(ConcordError::Consensus(format!(
                "applied entry {index} missing from log"
            )));
        };

        let state = self.state_machine.snapshot()?;
        let snapshot = RaftSnapshot::new(index, term, state);
        // the image must be durable before the entries it replaces go away
        self.snapshots.save(&snapshot)?;
        self.log.compact_to(index, term)?;

        self.metrics.inc_counter("snapshots_taken");
        info!(
            node = %self.id,
            last_included_index = index,
            last_included_term = term,
            retained = self.log.len(),
            "took snapshot"
        );
        Ok(Some(index))
    }

    fn on_install_snapshot(&mut self, req: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
        self.observe_term(req.term)?;
        let term = self.current_term();

        if req.term < term {
            return Ok(InstallSnapshotResponse {
                term,
                received: 0,
                installed: false,
            });
        }
        if self.is_leader() {
            error!(node = %self.id, term, other = %req.leader_id, "second leader in term");
            return Err(ConcordError::Consensus(format!(
                "{} also claims leadership of term {term}",
                req.leader_id
            )));
        }

        self.become_follower(Some(req.leader_id.clone()));
        self.ready.reset_election_timer = true;

        let index = req.last_included_index;
        let end = req.offset + req.data.len() as u64;
        if index <= self.commit_index {
            debug!(node = %self.id, index, commit_index = self.commit_index, "snapshot already covered");
            return Ok(InstallSnapshotResponse {
                term,
                received: end,
                installed: true,
            });
        }

        let mut incoming = match self.incoming_snapshot.take() {
            Some(incoming)
                if incoming.leader_term == term
                    && incoming.last_included_index == index
                    && incoming.last_included_term == req.last_included_term =>
            {
                incoming
            }
            _ => IncomingSnapshot {
                leader_term: term,
                last_included_index: index,
                last_included_term: req.last_included_term,
                data: Vec::new(),
            },
        };
        let held = incoming.data.len() as u64;
        if req.offset != held {
            // lost, duplicated or reordered chunk: point the leader at the gap
            debug!(node = %self.id, index, offset = req.offset, held, "snapshot chunk out of place");
            self.incoming_snapshot = Some(incoming);
            return Ok(InstallSnapshotResponse {
                term,
                received: held,
                installed: false,
            });
        }
        incoming.data.extend_from_slice(&req.data);
        if !req.done {
            self.incoming_snapshot = Some(incoming);
            return Ok(InstallSnapshotResponse {
                term,
                received: end,
                installed: false,
            });
        }

        self.install_snapshot(incoming, &req.leader_id)?;
        Ok(InstallSnapshotResponse {
            term,
            received: end,
            installed: true,
        })
    }

    fn install_snapshot(&mut self, incoming: IncomingSnapshot, leader: &str) -> Result<()> {
        let IncomingSnapshot {
            last_included_index: index,
            last_included_term: term,
            data,
            ..
        } = incoming;

        self.state_machine.restore(&data)?;
        let snapshot = RaftSnapshot::new(index, term, data);
        self.snapshots.save(&snapshot)?;

        // keep a suffix that agrees with the snapshot, otherwise start over
        if self.log.term_at(index) == Some(term) {
            self.log.compact_to(index, term)?;
        } else {
            self.log.reset_to_snapshot(index, term)?;
        }
        self.commit_index = index;
        self.last_applied = index;

        self.metrics.inc_counter("snapshots_installed");
        self.metrics.observe_gauge("commit_index", index as f64);
        info!(
            node = %self.id,
            leader,
            last_included_index = index,
            "installed snapshot"
        );
        Ok(())
    }

    fn on_install_snapshot_response(
        &mut self,
        from: &str,
        sent: SnapshotSummary,
        resp: InstallSnapshotResponse,
    ) -> Result<()> {
        self.release(from, sent.term);
        if self.observe_term(resp.term)? {
            return Ok(());
        }
        if sent.term != self.current_term() || !self.is_leader() {
            return Ok(());
        }

        if resp.installed {
            if let Some(state) = self.role.leader_state_mut() {
                state.snapshot_progress.remove(from);
            }
            let next = self.record_match(from, sent.last_included_index);
            self.advance_commit_index()?;
            if next <= self.log.last_index() {
                self.replicate_to(from)?;
            }
            return Ok(());
        }

        let Some(state) = self.role.leader_state_mut() else {
            return Ok(());
        };
        // only the reply to the chunk last sent moves the transfer
        if state.snapshot_progress.get(from) != Some(&(sent.last_included_index, sent.offset)) {
            return Ok(());
        }
        state
            .snapshot_progress
            .insert(from.to_string(), (sent.last_included_index, resp.received));
        self.replicate_to(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::log::LogEntry;
    use crate::raft::node::RaftOptions;
    use crate::raft::rpc::{AppendEntriesResponse, Request, RequestVoteResponse};
    use crate::raft::state_machine::{KeyValueStore, KvCommand};
    use crate::raft::storage::NodeStorage;

    fn kv_image(pairs: &[(&str, &str)], last_applied: LogIndex) -> Vec<u8> {
        let mut kv = KeyValueStore::default();
        for (i, (k, v)) in pairs.iter().enumerate() {
            let index = last_applied - pairs.len() as u64 + i as u64 + 1;
            kv.apply(index, &KvCommand::Set(k.to_string(), v.to_string()).encode());
        }
        kv.snapshot().unwrap()
    }

    fn follower(storage: NodeStorage) -> RaftNode<KeyValueStore> {
        RaftNode::new(
            "node1".into(),
            vec!["node2".into(), "node3".into()],
            storage,
            KeyValueStore::default(),
            RaftOptions::default(),
        )
        .unwrap()
    }

    fn install(term: Term, index: LogIndex, last_term: Term, data: Vec<u8>) -> InstallSnapshotRequest {
        InstallSnapshotRequest {
            term,
            leader_id: "node2".into(),
            last_included_index: index,
            last_included_term: last_term,
            offset: 0,
            data,
            done: true,
        }
    }

    fn chunk(image: &[u8], offset: usize, len: usize) -> InstallSnapshotRequest {
        let end = (offset + len).min(image.len());
        InstallSnapshotRequest {
            offset: offset as u64,
            data: image[offset..end].to_vec(),
            done: end == image.len(),
            ..install(2, 10, 2, vec![])
        }
    }

    #[test]
    fn test_snapshot_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileSnapshotStorage::new(snapshot_path(dir.path()));
        assert!(store.load().unwrap().is_none());

        let snap = RaftSnapshot::new(
            42,
            3,
            bincode::serialize(&KvCommand::Set("x".into(), "y".into())).unwrap(),
        );
        store.save(&snap).expect("Failed to save snapshot");
        let loaded = store.load().expect("Failed to load snapshot").unwrap();

        assert_eq!(loaded, snap);
    }

    #[test]
    fn test_snapshot_save_into_missing_dir_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileSnapshotStorage::new(dir.path().join("gone").join("snapshot.bin"));

        let err = store.save(&RaftSnapshot::new(1, 1, vec![])).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_memory_storage_keeps_latest() {
        let mut store = MemorySnapshotStorage::default();
        store.save(&RaftSnapshot::new(3, 1, vec![1])).unwrap();
        store.save(&RaftSnapshot::new(7, 2, vec![2])).unwrap();

        let latest = store.load().unwrap().unwrap();
        assert_eq!(latest.last_included_index, 7);
        assert_eq!(latest.state, vec![2]);
    }

    #[test]
    fn test_log_compacts_past_threshold() {
        let mut node = RaftNode::new(
            "solo".into(),
            vec![],
            NodeStorage::in_memory(),
            KeyValueStore::default(),
            RaftOptions {
                snapshot_threshold: 3,
                ..RaftOptions::default()
            },
        )
        .unwrap();
        node.start_election().unwrap();
        assert!(node.is_leader());

        for i in 0..4 {
            node.propose(KvCommand::Set(format!("k{i}"), "v".into()).encode())
                .unwrap();
        }

        assert_eq!(node.log().snapshot_index(), 4);
        assert!(node.log().is_empty());
        assert_eq!(node.log().last_index(), 4);
        let snap = node.snapshots.load().unwrap().unwrap();
        assert_eq!(snap.last_included_index, 4);
        assert_eq!(snap.last_included_term, 1);

        // later entries continue after the boundary
        let index = node.propose(KvCommand::Get("k0".into()).encode()).unwrap();
        assert_eq!(index, 5);
    }

    #[test]
    fn test_take_snapshot_without_new_entries_is_noop() {
        let mut node = follower(NodeStorage::in_memory());
        assert_eq!(node.take_snapshot().unwrap(), None);
    }

    #[test]
    fn test_install_snapshot_replaces_state() {
        let mut node = follower(NodeStorage::in_memory());

        let resp = node
            .handle_install_snapshot(install(2, 10, 2, kv_image(&[("a", "1"), ("b", "2")], 10)))
            .unwrap();

        assert_eq!(resp.term, 2);
        assert!(resp.installed);
        assert_eq!(node.commit_index(), 10);
        assert_eq!(node.last_applied(), 10);
        assert_eq!(node.log().snapshot_index(), 10);
        assert_eq!(node.log().last_index(), 10);
        assert_eq!(node.log().last_term(), 2);
        assert_eq!(node.state_machine().get("b"), Some("2".into()));
        assert_eq!(node.leader_hint(), Some("node2".into()));
        assert!(node.take_ready().reset_election_timer);
    }

    #[test]
    fn test_install_snapshot_keeps_matching_suffix() {
        let mut storage = NodeStorage::in_memory();
        storage
            .log
            .append((1..=5).map(|i| LogEntry::new(1, i, vec![])).collect())
            .unwrap();
        let mut node = follower(storage);

        node.handle_install_snapshot(install(1, 3, 1, kv_image(&[("a", "1")], 3)))
            .unwrap();

        assert_eq!(node.log().snapshot_index(), 3);
        assert_eq!(node.log().last_index(), 5);
        assert_eq!(node.log().len(), 2);
    }

    #[test]
    fn test_install_snapshot_discards_conflicting_log() {
        let mut storage = NodeStorage::in_memory();
        storage
            .log
            .append((1..=5).map(|i| LogEntry::new(1, i, vec![])).collect())
            .unwrap();
        let mut node = follower(storage);

        node.handle_install_snapshot(install(3, 4, 3, kv_image(&[("a", "1")], 4)))
            .unwrap();

        assert_eq!(node.log().last_index(), 4);
        assert!(node.log().is_empty());
        assert_eq!(node.log().term_at(4), Some(3));
    }

    #[test]
    fn test_install_snapshot_behind_commit_is_ignored() {
        let mut node = follower(NodeStorage::in_memory());
        node.handle_install_snapshot(install(1, 10, 1, kv_image(&[("a", "new")], 10)))
            .unwrap();

        node.handle_install_snapshot(install(1, 6, 1, kv_image(&[("a", "old")], 6)))
            .unwrap();
        assert_eq!(node.commit_index(), 10);
        assert_eq!(node.state_machine().get("a"), Some("new".into()));
    }

    #[test]
    fn test_install_snapshot_from_stale_term_rejected() {
        let mut storage = NodeStorage::in_memory();
        storage.metadata.set_term(5).unwrap();
        let mut node = follower(storage);

        let resp = node
            .handle_install_snapshot(install(4, 10, 4, kv_image(&[("a", "1")], 10)))
            .unwrap();
        assert_eq!(resp.term, 5);
        assert!(!resp.installed);
        assert_eq!(node.commit_index(), 0);
        assert!(node.snapshots.load().unwrap().is_none());
    }

    #[test]
    fn test_garbage_snapshot_leaves_node_untouched() {
        let mut node = follower(NodeStorage::in_memory());

        assert!(node
            .handle_install_snapshot(install(1, 10, 1, vec![9, 9, 9]))
            .is_err());
        assert!(!node.is_halted());
        assert_eq!(node.commit_index(), 0);
        assert_eq!(node.log().snapshot_index(), 0);
    }

    #[test]
    fn test_restart_restores_from_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut node = follower(NodeStorage::open(dir.path()).unwrap());
            node.handle_install_snapshot(install(2, 8, 2, kv_image(&[("k", "v")], 8)))
                .unwrap();
        }

        let node = follower(NodeStorage::open(dir.path()).unwrap());
        assert_eq!(node.last_applied(), 8);
        assert_eq!(node.commit_index(), 8);
        assert_eq!(node.current_term(), 2);
        assert_eq!(node.state_machine().get("k"), Some("v".into()));
    }

    #[test]
    fn test_leader_sends_snapshot_to_lagging_follower() {
        let mut storage = NodeStorage::in_memory();
        storage
            .snapshots
            .save(&RaftSnapshot::new(5, 1, kv_image(&[("a", "1")], 5)))
            .unwrap();
        storage.log.compact_to(5, 1).unwrap();
        storage.metadata.set_term(1).unwrap();

        let mut node = follower(storage);
        node.start_election().unwrap();
        node.handle_vote_response(
            "node2",
            2,
            RequestVoteResponse {
                term: 2,
                vote_granted: true,
            },
        )
        .unwrap();
        assert!(node.is_leader());

        let probe = node
            .take_ready()
            .messages
            .into_iter()
            .find_map(|m| match m.request {
                Request::AppendEntries(req) if m.to == "node2" => Some(req),
                _ => None,
            })
            .unwrap();
        assert_eq!(probe.prev_log_index, 5);
        assert_eq!(probe.prev_log_term, 1);

        // node2 has nothing at all
        let mut resp = AppendEntriesResponse::rejected(2);
        resp.conflict_index = Some(1);
        node.handle_append_entries_response("node2", probe.summary(), resp)
            .unwrap();

        let ready = node.take_ready();
        let sent = match &ready.messages[..] {
            [m] if m.to == "node2" => match &m.request {
                Request::InstallSnapshot(req) => req.clone(),
                other => panic!("expected snapshot, got {other:?}"),
            },
            other => panic!("unexpected messages {other:?}"),
        };
        assert_eq!(sent.last_included_index, 5);

        assert_eq!(sent.offset, 0);
        assert!(sent.done);
        let resp = InstallSnapshotResponse {
            term: 2,
            received: sent.data.len() as u64,
            installed: true,
        };
        node.handle_install_snapshot_response("node2", sent.summary(), resp)
            .unwrap();
        let state = node.role().leader_state().unwrap();
        assert_eq!(state.match_for("node2"), 5);
        assert_eq!(state.next_for("node2"), 6);
        assert!(!state.in_flight.contains("node2"));
    }

    #[test]
    fn test_install_snapshot_in_chunks() {
        let mut node = follower(NodeStorage::in_memory());
        let image = kv_image(&[("a", "1"), ("b", "2"), ("c", "3")], 10);
        let step = image.len() / 3 + 1;

        let resp = node.handle_install_snapshot(chunk(&image, 0, step)).unwrap();
        assert!(!resp.installed);
        assert_eq!(resp.received, step as u64);
        assert_eq!(node.commit_index(), 0);

        // a repeated chunk changes nothing and reports where to resume
        let resp = node.handle_install_snapshot(chunk(&image, 0, step)).unwrap();
        assert!(!resp.installed);
        assert_eq!(resp.received, step as u64);

        // so does one that skips ahead
        let resp = node
            .handle_install_snapshot(chunk(&image, 2 * step, step))
            .unwrap();
        assert_eq!(resp.received, step as u64);

        node.handle_install_snapshot(chunk(&image, step, step)).unwrap();
        let resp = node
            .handle_install_snapshot(chunk(&image, 2 * step, step))
            .unwrap();
        assert!(resp.installed);
        assert_eq!(resp.received, image.len() as u64);
        assert_eq!(node.commit_index(), 10);
        assert_eq!(node.state_machine().get("c"), Some("3".into()));
        assert!(node.incoming_snapshot.is_none());
    }

    #[test]
    fn test_chunks_from_a_new_leader_start_over() {
        let mut node = follower(NodeStorage::in_memory());
        let image = kv_image(&[("a", "1"), ("b", "2")], 10);
        node.handle_install_snapshot(chunk(&image, 0, 4)).unwrap();

        // same snapshot, but the next leader's encoding may differ
        let mut next = chunk(&image, 4, 4);
        next.term = 3;
        let resp = node.handle_install_snapshot(next).unwrap();
        assert!(!resp.installed);
        assert_eq!(resp.received, 0);
        assert_eq!(node.current_term(), 3);
    }

    #[test]
    fn test_chunk_of_another_snapshot_restarts_transfer() {
        let mut node = follower(NodeStorage::in_memory());
        let image = kv_image(&[("a", "1"), ("b", "2")], 10);
        node.handle_install_snapshot(chunk(&image, 0, 4)).unwrap();

        let mut other = chunk(&image, 4, 4);
        other.last_included_index = 12;
        let resp = node.handle_install_snapshot(other).unwrap();
        assert!(!resp.installed);
        assert_eq!(resp.received, 0);
        assert_eq!(
            node.incoming_snapshot.as_ref().map(|s| s.last_included_index),
            Some(12)
        );
    }

    #[test]
    fn test_leader_streams_snapshot_in_chunks() {
        let image = kv_image(&[("a", "1"), ("b", "2"), ("c", "3")], 5);
        let mut storage = NodeStorage::in_memory();
        storage
            .snapshots
            .save(&RaftSnapshot::new(5, 1, image.clone()))
            .unwrap();
        storage.log.compact_to(5, 1).unwrap();
        storage.metadata.set_term(1).unwrap();

        let mut node = RaftNode::new(
            "node1".into(),
            vec!["node2".into(), "node3".into()],
            storage,
            KeyValueStore::default(),
            RaftOptions {
                snapshot_chunk_bytes: 8,
                ..RaftOptions::default()
            },
        )
        .unwrap();
        node.start_election().unwrap();
        node.handle_vote_response(
            "node2",
            2,
            RequestVoteResponse {
                term: 2,
                vote_granted: true,
            },
        )
        .unwrap();
        node.take_ready();
        if let Some(state) = node.role.leader_state_mut() {
            state.next_index.insert("node2".into(), 1);
            state.in_flight.clear();
        }

        node.broadcast_heartbeat().unwrap();
        let mut received = Vec::new();
        let mut chunks = 0;
        loop {
            // each acknowledged chunk queues the next one
            let req = node
                .take_ready()
                .messages
                .into_iter()
                .find_map(|m| match m.request {
                    Request::InstallSnapshot(req) if m.to == "node2" => Some(req),
                    _ => None,
                })
                .unwrap();
            assert_eq!(req.offset, received.len() as u64);
            assert!(req.data.len() <= 8);
            received.extend_from_slice(&req.data);
            chunks += 1;

            let resp = InstallSnapshotResponse {
                term: 2,
                received: received.len() as u64,
                installed: req.done,
            };
            let done = req.done;
            node.handle_install_snapshot_response("node2", req.summary(), resp)
                .unwrap();
            if done {
                break;
            }
        }

        assert_eq!(received, image);
        assert_eq!(chunks, (image.len() + 7) / 8);
        let state = node.role().leader_state().unwrap();
        assert_eq!(state.match_for("node2"), 5);
        assert!(!state.snapshot_progress.contains_key("node2"));
    }
}
