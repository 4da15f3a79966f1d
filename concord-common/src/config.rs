use crate::error::{ConcordError, Result};
use crate::types::ClusterConfig;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Largest snapshot chunk; leaves headroom under the 64 MiB wire frame limit.
pub const MAX_SNAPSHOT_CHUNK_BYTES: usize = 32 * 1024 * 1024;

/// Loads a cluster configuration from a JSON file and validates it.
pub fn load_config(path: impl AsRef<Path>) -> Result<ClusterConfig> {
    let data = fs::read_to_string(path)?;
    let config: ClusterConfig = serde_json::from_str(&data)?;
    validate(&config)?;
    Ok(config)
}

/// Rejects configurations under which the election and heartbeat timing
/// could not keep a stable leader.
pub fn validate(config: &ClusterConfig) -> Result<()> {
    if config.nodes.is_empty() {
        return Err(ConcordError::Config("cluster has no nodes".into()));
    }

    let mut seen = HashSet::new();
    for node in &config.nodes {
        if !seen.insert(node.node_id.as_str()) {
            return Err(ConcordError::Config(format!(
                "duplicate node id {}",
                node.node_id
            )));
        }
    }

    if config.election_timeout_min_ms >= config.election_timeout_max_ms {
        return Err(ConcordError::Config(
            "election_timeout_min_ms must be below election_timeout_max_ms".into(),
        ));
    }
    if config.heartbeat_interval_ms == 0
        || config.heartbeat_interval_ms >= config.election_timeout_min_ms
    {
        return Err(ConcordError::Config(
            "heartbeat_interval_ms must be non-zero and below election_timeout_min_ms".into(),
        ));
    }
    if config.rpc_timeout_ms == 0 || config.rpc_timeout_ms >= config.election_timeout_min_ms {
        return Err(ConcordError::Config(
            "rpc_timeout_ms must be non-zero and below election_timeout_min_ms".into(),
        ));
    }
    // a lost request silences a peer for up to one rpc timeout plus one tick
    if config.rpc_timeout_ms + config.heartbeat_interval_ms >= config.election_timeout_min_ms {
        return Err(ConcordError::Config(
            "rpc_timeout_ms + heartbeat_interval_ms must be below election_timeout_min_ms".into(),
        ));
    }
    if config.snapshot_threshold == 0 || config.max_entries_per_append == 0 {
        return Err(ConcordError::Config(
            "snapshot_threshold and max_entries_per_append must be non-zero".into(),
        ));
    }
    if config.snapshot_chunk_bytes == 0 || config.snapshot_chunk_bytes > MAX_SNAPSHOT_CHUNK_BYTES {
        return Err(ConcordError::Config(format!(
            "snapshot_chunk_bytes must be between 1 and {MAX_SNAPSHOT_CHUNK_BYTES}"
        )));
    }
    Ok(())
}
