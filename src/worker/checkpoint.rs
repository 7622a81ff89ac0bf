//! Checkpoint files: a worker's partitions, its next-superstep inbox, and
//! the aggregator values broadcast for the resume superstep, written under
//! `<root>/superstep-<n>/worker-<id>.ckpt`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::graph::{PartitionId, SuperstepId, WorkerId};
use crate::utils::GraphyneError;

/// Serialized checkpoint payload for one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    /// The superstep to resume computing.
    pub superstep: SuperstepId,

    /// Serialized partitions (`Partition::write` bytes).
    pub partitions: Vec<(PartitionId, Vec<u8>)>,

    /// Frozen inbox for the resume superstep: per partition, per encoded
    /// vertex id, encoded message bytes.
    pub inbox: Vec<(PartitionId, Vec<(Vec<u8>, Vec<Vec<u8>>)>)>,

    /// Finalized aggregator values broadcast for the resume superstep.
    pub finalized: HashMap<String, Vec<u8>>,
}

fn checkpoint_path(
    root: &Path,
    superstep: SuperstepId,
    worker: WorkerId,
) -> PathBuf {
    root.join(format!("superstep-{}", superstep))
        .join(format!("worker-{}.ckpt", worker))
}

/// Writes a worker checkpoint. Errors are surfaced for the caller to log;
/// checkpoint write failures are non-fatal by contract.
pub async fn write_checkpoint(
    root: &Path,
    worker: WorkerId,
    file: &CheckpointFile,
) -> Result<(), GraphyneError> {
    let path = checkpoint_path(root, file.superstep, worker);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await?;
    }
    let bytes = rmp_serde::encode::to_vec(file)?;
    // write-then-rename so a torn write never looks like a checkpoint
    let tmp = path.with_extension("ckpt.tmp");
    fs::write(&tmp, &bytes).await?;
    fs::rename(&tmp, &path).await?;
    pf_debug!(
        worker;
        "wrote checkpoint for superstep {} ({} bytes)",
        file.superstep,
        bytes.len()
    );
    Ok(())
}

/// Reads a worker checkpoint for a restart.
pub async fn read_checkpoint(
    root: &Path,
    superstep: SuperstepId,
    worker: WorkerId,
) -> Result<CheckpointFile, GraphyneError> {
    let path = checkpoint_path(root, superstep, worker);
    let bytes = fs::read(&path).await.map_err(|e| {
        GraphyneError::Io(format!(
            "checkpoint '{}' unreadable: {}",
            path.display(),
            e
        ))
    })?;
    Ok(rmp_serde::decode::from_slice(&bytes)?)
}

/// Removes every checkpoint under the root (post-success cleanup).
pub async fn cleanup_checkpoints(root: &Path) -> Result<(), GraphyneError> {
    if fs::try_exists(root).await? {
        fs::remove_dir_all(root).await?;
    }
    Ok(())
}
