use std::path::{Path, PathBuf};

use concord_common::error::{ConcordError, Result};
use concord_common::types::{NodeId, Term};
use serde::{Deserialize, Serialize};

use super::durable::{read_optional, write_atomic};

/// Durable election state: the latest term seen and the vote cast in it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub current_term: Term,
    pub voted_for: Option<NodeId>, // only meaningful for current_term
}

/// Holds [`Metadata`] and, when file-backed, writes every change to disk
/// before the new value becomes visible.
#[derive(Debug, Default)]
pub struct MetadataStore {
    state: Metadata,
    path: Option<PathBuf>,
}

impl MetadataStore {
    /// Memory-only store starting at term 0 with no vote
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let state = match read_optional(&path)? {
            Some(bytes) => bincode::deserialize(&bytes)?,
            None => Metadata::default(),
        };
        Ok(Self {
            state,
            path: Some(path),
        })
    }

    pub fn current_term(&self) -> Term {
        self.state.current_term
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.state.voted_for.as_ref()
    }

    /// Moves to a newer term. The vote is cleared along with it.
    pub fn set_term(&mut self, term: Term) -> Result<()> {
        self.update(term, None)
    }

    /// Records a vote in the current term.
    pub fn set_voted_for(&mut self, candidate: Option<NodeId>) -> Result<()> {
        self.update(self.state.current_term, candidate)
    }

    /// Writes term and vote together.
    pub fn update(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        if term < self.state.current_term {
            return Err(ConcordError::Consensus(format!(
                "term must not go backwards ({} -> {term})",
                self.state.current_term
            )));
        }

        let next = Metadata {
            current_term: term,
            voted_for,
        };
        if let Some(path) = &self.path {
            let bytes = bincode::serialize(&next)?;
            write_atomic(path, &bytes).map_err(|e| ConcordError::persistence("write metadata", e))?;
        }
        self.state = next;
        Ok(())
    }
}

/// Path of the metadata file inside a node's data directory.
pub fn metadata_path(dir: &Path) -> PathBuf {
    dir.join("meta.bin")
}
