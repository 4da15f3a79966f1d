use std::collections::{HashMap, HashSet};
use std::fmt;

use concord_common::types::{LogIndex, NodeId};
use serde::{Deserialize, Serialize};

/// Role of the node in the cluster, without its per-role data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

impl NodeRole {
    /// The allowed role transitions.
    ///
    /// | from \ to | Follower | Candidate | Leader |
    /// |-----------|----------|-----------|--------|
    /// | Follower  | yes      | yes       | no     |
    /// | Candidate | yes      | yes       | yes    |
    /// | Leader    | yes      | no        | no     |
    pub fn can_become(self, next: NodeRole) -> bool {
        use NodeRole::*;
        matches!(
            (self, next),
            (_, Follower) | (Follower, Candidate) | (Candidate, Candidate) | (Candidate, Leader)
        )
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeRole::Follower => "follower",
            NodeRole::Candidate => "candidate",
            NodeRole::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// Per-follower replication progress, kept only while leading
#[derive(Debug, Clone, PartialEq)]
pub struct LeaderState {
    pub next_index: HashMap<NodeId, LogIndex>, // For each peer: next entry to send
    pub match_index: HashMap<NodeId, LogIndex>, // For each peer: last index known replicated
    /// Peers with an AppendEntries/InstallSnapshot awaiting a reply
    pub in_flight: HashSet<NodeId>,
    /// Snapshot transfers under way: (last included index, next offset)
    pub snapshot_progress: HashMap<NodeId, (LogIndex, u64)>,
}

impl LeaderState {
    pub fn new<'a>(peers: impl IntoIterator<Item = &'a NodeId>, last_log_index: LogIndex) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for peer in peers {
            next_index.insert(peer.clone(), last_log_index + 1);
            match_index.insert(peer.clone(), 0);
        }
        Self {
            next_index,
            match_index,
            in_flight: HashSet::new(),
            snapshot_progress: HashMap::new(),
        }
    }

    pub fn next_for(&self, peer: &str) -> LogIndex {
        self.next_index.get(peer).copied().unwrap_or(1)
    }

    pub fn match_for(&self, peer: &str) -> LogIndex {
        self.match_index.get(peer).copied().unwrap_or(0)
    }
}

/// The active role together with the state that is only valid in it
#[derive(Debug, Clone, PartialEq)]
pub enum Role {
    Follower { leader_hint: Option<NodeId> },
    Candidate { votes_received: HashSet<NodeId> },
    Leader(LeaderState),
}

impl Role {
    pub fn kind(&self) -> NodeRole {
        match self {
            Role::Follower { .. } => NodeRole::Follower,
            Role::Candidate { .. } => NodeRole::Candidate,
            Role::Leader(_) => NodeRole::Leader,
        }
    }

    pub fn leader_state(&self) -> Option<&LeaderState> {
        match self {
            Role::Leader(state) => Some(state),
            _ => None,
        }
    }

    pub fn leader_state_mut(&mut self) -> Option<&mut LeaderState> {
        match self {
            Role::Leader(state) => Some(state),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use NodeRole::*;
        assert!(Follower.can_become(Candidate));
        assert!(Candidate.can_become(Candidate));
        assert!(Candidate.can_become(Leader));
        assert!(Leader.can_become(Follower));
        assert!(Candidate.can_become(Follower));

        assert!(!Follower.can_become(Leader));
        assert!(!Leader.can_become(Candidate));
        assert!(!Leader.can_become(Leader));
    }

    #[test]
    fn test_leader_state_starts_past_own_log() {
        let peers = vec!["n2".to_string(), "n3".to_string()];
        let state = LeaderState::new(&peers, 7);

        assert_eq!(state.next_for("n2"), 8);
        assert_eq!(state.match_for("n3"), 0);
        assert!(state.in_flight.is_empty());
    }
}
