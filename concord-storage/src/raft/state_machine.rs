use concord_common::error::Result;
use concord_common::types::LogIndex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Trait for any Raft-compatible state machine.
///
/// Commands and results are opaque bytes to the consensus layer. `apply` must
/// be deterministic, and since a crash can land between applying an entry
/// and recording that fact, applying the same index twice must not change
/// the outcome; `index` is provided so implementations can dedup.
pub trait StateMachine: Send + 'static {
    /// Applies the command committed at `index` and returns its result
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Vec<u8>;

    /// Produces a binary image of the current state
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replaces the current state with a previously produced image
    fn restore(&mut self, image: &[u8]) -> Result<()>;
}

//
// Example Implementation: In-Memory Key-Value Store
//

/// Commands that the key-value store can handle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum KvCommand {
    Set(String, String),
    Get(String),
    Delete(String),
    Cas {
        key: String,
        expected: Option<String>,
        value: String,
    },
}

impl KvCommand {
    pub fn encode(&self) -> Vec<u8> {
        // plain enums of strings always serialize
        bincode::serialize(self).unwrap_or_default()
    }
}

/// Response type returned by the state machine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum KvResponse {
    Value(Option<String>),
    Ack,
    Swapped {
        swapped: bool,
        current: Option<String>,
    },
    /// The index was applied before; nothing changed
    AlreadyApplied,
    Error(String),
}

impl KvResponse {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KvImage {
    data: HashMap<String, String>,
    last_applied: LogIndex,
}

/// The in-memory key-value store with Raft StateMachine trait.
///
/// Remembers the last index it applied so replays are no-ops.
#[derive(Debug, Default)]
pub struct KeyValueStore {
    data: HashMap<String, String>,
    last_applied: LogIndex,
}

impl KeyValueStore {
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    fn execute(&mut self, command: KvCommand) -> KvResponse {
        match command {
            KvCommand::Set(k, v) => {
                self.data.insert(k, v);
                KvResponse::Ack
            }
            KvCommand::Get(k) => KvResponse::Value(self.data.get(&k).cloned()),
            KvCommand::Delete(k) => {
                self.data.remove(&k);
                KvResponse::Ack
            }
            KvCommand::Cas {
                key,
                expected,
                value,
            } => {
                let current = self.data.get(&key).cloned();
                if current == expected {
                    self.data.insert(key, value);
                    KvResponse::Swapped {
                        swapped: true,
                        current: None,
                    }
                } else {
                    KvResponse::Swapped {
                        swapped: false,
                        current,
                    }
                }
            }
        }
    }
}

impl StateMachine for KeyValueStore {
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Vec<u8> {
        if index <= self.last_applied {
            return KvResponse::AlreadyApplied.encode();
        }
        self.last_applied = index;

        let response = match bincode::deserialize::<KvCommand>(command) {
            Ok(cmd) => self.execute(cmd),
            Err(e) => KvResponse::Error(format!("undecodable command: {e}")),
        };
        response.encode()
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        let image = KvImage {
            data: self.data.clone(),
            last_applied: self.last_applied,
        };
        Ok(bincode::serialize(&image)?)
    }

    fn restore(&mut self, image: &[u8]) -> Result<()> {
        let image: KvImage = bincode::deserialize(image)?;
        self.data = image.data;
        self.last_applied = image.last_applied;
        Ok(())
    }
}
