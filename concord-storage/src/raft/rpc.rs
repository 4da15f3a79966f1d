use super::log::LogEntry;
use concord_common::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

/// Sent by leader to replicate log entries or as heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,               // Leader’s term
    pub leader_id: NodeId,        // Leader's ID
    pub prev_log_index: LogIndex, // Index of log entry before new ones
    pub prev_log_term: Term,      // Term of that entry
    pub entries: Vec<LogEntry>,   // New log entries to store
    pub leader_commit: LogIndex,  // Leader’s commit index
}

impl AppendEntriesRequest {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }

    /// What the leader needs to remember to interpret the reply.
    pub fn summary(&self) -> AppendSummary {
        AppendSummary {
            term: self.term,
            prev_log_index: self.prev_log_index,
            entries: self.entries.len() as u64,
        }
    }
}

/// The parts of a sent AppendEntries that its reply is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendSummary {
    pub term: Term,
    pub prev_log_index: LogIndex,
    pub entries: u64,
}

impl AppendSummary {
    /// Index of the last entry the request carried (or its prev index)
    pub fn last_index(&self) -> LogIndex {
        self.prev_log_index + self.entries
    }
}

/// Response from follower to AppendEntries RPC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,    // Current term (may be newer)
    pub success: bool, // True if follower appended entries
    /// On rejection: where the leader should resume probing
    pub conflict_index: Option<LogIndex>,
    /// On rejection: the follower's term at `prev_log_index`, if it had one
    pub conflict_term: Option<Term>,
}

impl AppendEntriesResponse {
    pub fn accepted(term: Term) -> Self {
        Self {
            term,
            success: true,
            conflict_index: None,
            conflict_term: None,
        }
    }

    pub fn rejected(term: Term) -> Self {
        Self {
            term,
            success: false,
            conflict_index: None,
            conflict_term: None,
        }
    }
}

/// RequestVote RPC: Candidate → Peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Response to RequestVote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// InstallSnapshot RPC: Leader → follower whose next entry was compacted away
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub offset: u64,   // Byte position of `data` within the image
    pub data: Vec<u8>, // One chunk of the state machine image
    pub done: bool,    // Set on the chunk that ends the image
}

impl InstallSnapshotRequest {
    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            term: self.term,
            last_included_index: self.last_included_index,
            offset: self.offset,
            len: self.data.len() as u64,
            done: self.done,
        }
    }
}

/// The parts of a sent InstallSnapshot chunk that its reply is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub term: Term,
    pub last_included_index: LogIndex,
    pub offset: u64,
    pub len: u64,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    /// Offset of the next chunk the follower can take
    pub received: u64,
    /// The follower holds everything up to `last_included_index`
    pub installed: bool,
}

/// Any peer-to-peer request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
    InstallSnapshot(InstallSnapshotRequest),
}

impl Request {
    pub fn term(&self) -> Term {
        match self {
            Request::RequestVote(req) => req.term,
            Request::AppendEntries(req) => req.term,
            Request::InstallSnapshot(req) => req.term,
        }
    }
}

/// A request queued by the node for delivery to `to`.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: NodeId,
    pub request: Request,
}
