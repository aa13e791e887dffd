//! Append-only checkpoint log.
//!
//! One JSONL file per workflow id. Checkpoints are immutable once
//! written; reads are latest-wins. The only destructive operation is
//! the explicit, opt-in [`CheckpointStore::cleanup`].

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clog_warn;
use crate::error::Result;
use crate::workflow::{Stage, WorkflowId};

/// An immutable snapshot of one stage's data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The workflow this checkpoint belongs to.
    pub workflow: WorkflowId,
    /// The stage that produced the snapshot.
    pub stage: Stage,
    /// Stage data at snapshot time.
    pub payload: serde_json::Value,
    /// When the snapshot was written.
    pub created_at: DateTime<Utc>,
}

/// File-backed, append-only checkpoint storage.
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Create a store rooted at `root`, creating the directory if
    /// needed.
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn log_path(&self, id: WorkflowId) -> PathBuf {
        self.root.join(format!("{}.checkpoints.jsonl", id))
    }

    /// Append a checkpoint for `id` at `stage`.
    pub fn create(
        &self,
        id: WorkflowId,
        stage: Stage,
        payload: serde_json::Value,
    ) -> Result<Checkpoint> {
        let checkpoint = Checkpoint {
            workflow: id,
            stage,
            payload,
            created_at: Utc::now(),
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(id))?;
        writeln!(file, "{}", serde_json::to_string(&checkpoint)?)?;

        Ok(checkpoint)
    }

    /// Every checkpoint for `id`, oldest first.
    ///
    /// A torn trailing line (crash mid-append) is skipped with a
    /// warning rather than poisoning the whole log.
    pub fn all(&self, id: WorkflowId) -> Result<Vec<Checkpoint>> {
        let path = self.log_path(id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut checkpoints = Vec::new();
        for line in fs::read_to_string(&path)?.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Checkpoint>(line) {
                Ok(cp) => checkpoints.push(cp),
                Err(e) => {
                    clog_warn!(
                        "skipping unreadable checkpoint line for workflow {}: {}",
                        id.short(),
                        e
                    );
                }
            }
        }
        Ok(checkpoints)
    }

    /// The most recent checkpoint for `id`, optionally restricted to
    /// one stage.
    pub fn latest(&self, id: WorkflowId, stage: Option<Stage>) -> Result<Option<Checkpoint>> {
        Ok(self
            .all(id)?
            .into_iter()
            .rev()
            .find(|cp| stage.map(|s| cp.stage == s).unwrap_or(true)))
    }

    /// Delete checkpoints older than `older_than`, returning how many
    /// were removed. This is the only destructive operation and must be
    /// invoked explicitly; retention policy lives in configuration.
    pub fn cleanup(&self, id: WorkflowId, older_than: DateTime<Utc>) -> Result<usize> {
        let checkpoints = self.all(id)?;
        let (keep, drop): (Vec<_>, Vec<_>) = checkpoints
            .into_iter()
            .partition(|cp| cp.created_at >= older_than);

        if drop.is_empty() {
            return Ok(0);
        }

        let path = self.log_path(id);
        let tmp = self.root.join(format!("{}.checkpoints.jsonl.tmp", id));
        let mut contents = String::new();
        for cp in &keep {
            contents.push_str(&serde_json::to_string(cp)?);
            contents.push('\n');
        }
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &path)?;

        Ok(drop.len())
    }
}
