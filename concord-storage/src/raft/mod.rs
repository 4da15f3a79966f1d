// Raft consensus: durable log, node state machine, replication and the
// async driver that connects a node to its peers
pub mod commit;
pub mod driver;
mod durable;
pub mod lock;
pub mod log;
pub mod metadata;
pub mod node;
pub mod replication;
pub mod role;
pub mod rpc;
pub mod snapshot;
pub mod state_machine;
pub mod storage;
pub mod timer;
pub mod transport;
