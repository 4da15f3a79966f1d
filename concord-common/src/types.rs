pub type NodeId = String;
pub type Term = u64;
pub type LogIndex = u64;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
    pub node_id: NodeId,
}

impl NodeAddress {
    /// `host:port`, suitable for `TcpStream::connect`
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Static cluster membership plus the timing knobs every node must agree on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeAddress>,
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,
    /// Retained log entries allowed before the log is compacted into a snapshot
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,
    #[serde(default = "default_max_entries_per_append")]
    pub max_entries_per_append: usize,
    /// Image bytes per InstallSnapshot chunk
    #[serde(default = "default_snapshot_chunk_bytes")]
    pub snapshot_chunk_bytes: usize,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_election_timeout_min_ms() -> u64 {
    150
}

fn default_election_timeout_max_ms() -> u64 {
    300
}

fn default_heartbeat_interval_ms() -> u64 {
    50
}

fn default_rpc_timeout_ms() -> u64 {
    80
}

fn default_submit_timeout_ms() -> u64 {
    5_000
}

fn default_snapshot_threshold() -> u64 {
    1_000
}

fn default_max_entries_per_append() -> usize {
    64
}

fn default_snapshot_chunk_bytes() -> usize {
    1024 * 1024
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl ClusterConfig {
    /// A config with default timings for the given nodes.
    pub fn new(nodes: Vec<NodeAddress>) -> Self {
        Self {
            nodes,
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            submit_timeout_ms: default_submit_timeout_ms(),
            snapshot_threshold: default_snapshot_threshold(),
            max_entries_per_append: default_max_entries_per_append(),
            snapshot_chunk_bytes: default_snapshot_chunk_bytes(),
            data_dir: default_data_dir(),
        }
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.node_id.clone()).collect()
    }

    /// Every node except `id`.
    pub fn peers_of(&self, id: &str) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.node_id != id)
            .map(|n| n.node_id.clone())
            .collect()
    }

    pub fn address_of(&self, id: &str) -> Option<&NodeAddress> {
        self.nodes.iter().find(|n| n.node_id == id)
    }

    pub fn election_timeout_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.election_timeout_min_ms),
            Duration::from_millis(self.election_timeout_max_ms),
        )
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }
}
