//! Replicated log consensus: a Raft node, its durable stores, the
//! transports it talks over and the async driver that serializes it.

pub mod raft;

pub use raft::driver::{spawn_node, NodeHandle, SubmitResponse};
pub use raft::lock::{LockCommand, LockResponse, LockTable};
pub use raft::log::{LogEntry, RaftLog};
pub use raft::node::{NodeStatus, RaftNode, RaftOptions};
pub use raft::state_machine::{KeyValueStore, KvCommand, KvResponse, StateMachine};
pub use raft::transport::{LocalNetwork, TcpTransport, Transport};
