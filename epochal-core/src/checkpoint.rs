//! Checkpoint management for experiment state.
//!
//! Each checkpoint is one JSON file holding an [`ExperimentState`]. A
//! `checkpoints.json` manifest next to them records epoch, content hash and
//! size, and only the newest `keep_last` checkpoints are retained. Manifest
//! paths are relative to the checkpoint directory, so a moved directory can
//! still be resumed.

use crate::error::{ExperimentError, Result};
use crate::state::ExperimentState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const MANIFEST: &str = "checkpoints.json";

/// A saved checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: usize,
    pub path: PathBuf,
    pub hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Checkpoint manager.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    keep_last: usize,
}

impl CheckpointManager {
    /// `keep_last == 0` keeps every checkpoint.
    pub fn new(dir: impl Into<PathBuf>, keep_last: usize) -> Self {
        Self {
            dir: dir.into(),
            keep_last,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// List checkpoints, oldest first. Paths are resolved against [`Self::dir`].
    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        let manifest = self.dir.join(MANIFEST);
        if !manifest.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&manifest)?;
        let mut checkpoints: Vec<Checkpoint> = serde_json::from_str(&content)?;
        for checkpoint in &mut checkpoints {
            checkpoint.path = self.dir.join(&checkpoint.path);
        }
        Ok(checkpoints)
    }

    /// The checkpoint with the highest epoch.
    pub fn latest(&self) -> Result<Option<Checkpoint>> {
        Ok(self.list()?.into_iter().max_by_key(|c| c.epoch))
    }

    /// Save `state` as the checkpoint for `epoch`, replacing any previous one
    /// for the same epoch.
    pub fn save(&self, epoch: usize, state: &ExperimentState) -> Result<Checkpoint> {
        std::fs::create_dir_all(&self.dir)?;

        let bytes = serde_json::to_vec_pretty(state)?;
        let path = self.dir.join(format!("experiment-epoch-{epoch:04}.json"));
        atomic_write(&path, &bytes)?;

        let checkpoint = Checkpoint {
            epoch,
            path,
            hash: sha256_hex(&bytes),
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        };

        let mut checkpoints = self.list()?;
        checkpoints.retain(|c| c.epoch != epoch);
        checkpoints.push(checkpoint.clone());
        checkpoints.sort_by_key(|c| c.epoch);

        let excess = match self.keep_last {
            0 => 0,
            keep => checkpoints.len().saturating_sub(keep),
        };
        let pruned: Vec<Checkpoint> = checkpoints.drain(..excess).collect();

        // Files are only removed once the manifest no longer points at them.
        self.write_manifest(&checkpoints)?;
        for old in &pruned {
            if let Err(e) = std::fs::remove_file(&old.path) {
                warn!(
                    path = %old.path.display(),
                    error = %e,
                    "Failed to remove old checkpoint"
                );
            }
        }

        info!(
            epoch,
            path = %checkpoint.path.display(),
            size_bytes = checkpoint.size_bytes,
            "Checkpoint saved"
        );
        Ok(checkpoint)
    }

    fn write_manifest(&self, checkpoints: &[Checkpoint]) -> Result<()> {
        let entries: Vec<Checkpoint> = checkpoints
            .iter()
            .map(|c| Checkpoint {
                path: c.path.strip_prefix(&self.dir).unwrap_or(&c.path).to_path_buf(),
                ..c.clone()
            })
            .collect();
        let manifest = serde_json::to_vec_pretty(&entries)?;
        atomic_write(&self.dir.join(MANIFEST), &manifest)?;
        Ok(())
    }

    /// Load a checkpoint, verifying its content hash.
    pub fn load(&self, checkpoint: &Checkpoint) -> Result<ExperimentState> {
        let bytes = std::fs::read(&checkpoint.path)?;
        let hash = sha256_hex(&bytes);
        if hash != checkpoint.hash {
            return Err(ExperimentError::checkpoint(format!(
                "hash mismatch for {} (expected {}, found {hash})",
                checkpoint.path.display(),
                checkpoint.hash
            )));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Load the newest checkpoint, if there is one.
    pub fn load_latest(&self) -> Result<Option<(Checkpoint, ExperimentState)>> {
        match self.latest()? {
            Some(checkpoint) => {
                let state = self.load(&checkpoint)?;
                Ok(Some((checkpoint, state)))
            }
            None => Ok(None),
        }
    }
}

/// Load experiment state from a file written by [`CheckpointManager::save`].
pub fn load_state_file(path: &Path) -> Result<ExperimentState> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Write to a `.tmp` sibling, then rename over the target.
fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}
