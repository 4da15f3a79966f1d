use std::path::Path;

use concord_common::error::Result;

use super::durable::sync_parent;
use super::log::{log_path, RaftLog};
use super::metadata::{metadata_path, MetadataStore};
use super::snapshot::{snapshot_path, FileSnapshotStorage, MemorySnapshotStorage, SnapshotStorage};

/// Everything a node keeps durable: log, term/vote, latest snapshot.
pub struct NodeStorage {
    pub log: RaftLog,
    pub metadata: MetadataStore,
    pub snapshots: Box<dyn SnapshotStorage>,
}

impl NodeStorage {
    /// Volatile storage, for tests and throwaway clusters
    pub fn in_memory() -> Self {
        Self {
            log: RaftLog::new(),
            metadata: MetadataStore::new(),
            snapshots: Box::new(MemorySnapshotStorage::default()),
        }
    }

    /// File-backed storage under `dir`, created if missing
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        sync_parent(dir)?;
        Ok(Self {
            log: RaftLog::open(log_path(dir))?,
            metadata: MetadataStore::open(metadata_path(dir))?,
            snapshots: Box::new(FileSnapshotStorage::new(snapshot_path(dir))),
        })
    }
}
