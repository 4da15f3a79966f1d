use crate::types::{LogIndex, NodeId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConcordError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Codec Error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Consensus Error: {0}")]
    Consensus(String),

    #[error("Not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("Log gap: expected index {expected}, got {got}")]
    LogGap { expected: LogIndex, got: LogIndex },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Persistence Error: {0}")]
    Persistence(String),

    #[error("Node halted after a persistence failure")]
    Halted,

    #[error("Node is shutting down")]
    Shutdown,
}

impl ConcordError {
    /// Errors after which the node must stop participating in the protocol.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConcordError::Persistence(_) | ConcordError::Halted)
    }

    /// Wraps a failed durable write so callers can't mistake it for a
    /// recoverable I/O hiccup.
    pub fn persistence(context: &str, err: impl std::fmt::Display) -> Self {
        ConcordError::Persistence(format!("{context}: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, ConcordError>;
