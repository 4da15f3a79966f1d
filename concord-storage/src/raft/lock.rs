use concord_common::error::Result;
use concord_common::types::LogIndex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::state_machine::StateMachine;

/// Commands understood by the lock service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LockCommand {
    Acquire { lock: String, owner: String },
    Release { lock: String, owner: String },
    Status { lock: String },
}

impl LockCommand {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LockResponse {
    /// The caller holds the lock; `already_held` if it did before
    Acquired { already_held: bool },
    /// Someone else holds it
    Busy { holder: String },
    Released,
    NotHolder,
    Status { holder: Option<String> },
    AlreadyApplied,
    Error(String),
}

impl LockResponse {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LockImage {
    holders: HashMap<String, String>,
    last_applied: LogIndex,
}

/// Named mutual-exclusion locks replicated through the log.
///
/// Like [`KeyValueStore`](super::state_machine::KeyValueStore) it keeps the
/// last applied index in its image, so replayed entries are no-ops.
#[derive(Debug, Default)]
pub struct LockTable {
    holders: HashMap<String, String>,
    last_applied: LogIndex,
}

impl LockTable {
    pub fn holder(&self, lock: &str) -> Option<&str> {
        self.holders.get(lock).map(String::as_str)
    }

    pub fn held(&self) -> usize {
        self.holders.len()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    fn execute(&mut self, command: LockCommand) -> LockResponse {
        match command {
            LockCommand::Acquire { lock, owner } => match self.holders.get(&lock) {
                None => {
                    self.holders.insert(lock, owner);
                    LockResponse::Acquired {
                        already_held: false,
                    }
                }
                Some(holder) if *holder == owner => LockResponse::Acquired { already_held: true },
                Some(holder) => LockResponse::Busy {
                    holder: holder.clone(),
                },
            },
            LockCommand::Release { lock, owner } => {
                if self.holders.get(&lock) == Some(&owner) {
                    self.holders.remove(&lock);
                    LockResponse::Released
                } else {
                    LockResponse::NotHolder
                }
            }
            LockCommand::Status { lock } => LockResponse::Status {
                holder: self.holders.get(&lock).cloned(),
            },
        }
    }
}

impl StateMachine for LockTable {
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Vec<u8> {
        if index <= self.last_applied {
            return LockResponse::AlreadyApplied.encode();
        }
        self.last_applied = index;

        let response = match bincode::deserialize::<LockCommand>(command) {
            Ok(cmd) => self.execute(cmd),
            Err(e) => LockResponse::Error(format!("undecodable command: {e}")),
        };
        response.encode()
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        let image = LockImage {
            holders: self.holders.clone(),
            last_applied: self.last_applied,
        };
        Ok(bincode::serialize(&image)?)
    }

    fn restore(&mut self, image: &[u8]) -> Result<()> {
        let image: LockImage = bincode::deserialize(image)?;
        self.holders = image.holders;
        self.last_applied = image.last_applied;
        Ok(())
    }
}
