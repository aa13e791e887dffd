//! Atomic, transactional storage for workflow state records.
//!
//! One JSON file per workflow id. Saves go through a temp file and an
//! atomic rename, so a crash mid-write can never corrupt the record.
//! Mutation happens inside a [`Transaction`]: an exclusive per-id lock
//! is held around load, in-memory mutation, and persist - never across
//! a network call. A second transaction on the same id blocks for a
//! bounded wait, then fails fast with `LockTimeoutError`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{Error, Result};
use crate::workflow::{WorkflowId, WorkflowState};
use crate::{clog_debug, clog_trace};

/// File-backed store of workflow state records.
#[derive(Debug)]
pub struct StateStore {
    root: PathBuf,
    lock_timeout: Duration,
    /// One async mutex per workflow id, created on first use. The map
    /// itself is guarded by a plain mutex held only for the lookup.
    locks: StdMutex<HashMap<WorkflowId, Arc<AsyncMutex<()>>>>,
}

impl StateStore {
    /// Create a store rooted at `root`, creating the directory if
    /// needed.
    pub fn new(root: &Path, lock_timeout: Duration) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            lock_timeout,
            locks: StdMutex::new(HashMap::new()),
        })
    }

    /// The directory records live in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: WorkflowId) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }

    /// Load the record for `id`, or a fresh default if none exists.
    ///
    /// A malformed record is never silently reset: it surfaces as
    /// `StateCorruptionError` naming the id and the offending field.
    pub fn load(&self, id: WorkflowId) -> Result<WorkflowState> {
        let path = self.record_path(id);
        if !path.exists() {
            clog_trace!("StateStore::load {} -> fresh default", id.short());
            return Ok(WorkflowState::new(id));
        }

        let raw = fs::read_to_string(&path)?;
        let state: WorkflowState =
            serde_json::from_str(&raw).map_err(|e| Error::StateCorruption {
                id,
                detail: e.to_string(),
            })?;

        if state.id != id {
            return Err(Error::StateCorruption {
                id,
                detail: format!("field 'id' holds {}, expected {}", state.id, id),
            });
        }

        Ok(state)
    }

    /// Whether a record exists on disk for `id`.
    pub fn exists(&self, id: WorkflowId) -> bool {
        self.record_path(id).exists()
    }

    /// Persist the record atomically: write a temp file, then rename
    /// it over the record. A crash between the two steps leaves the
    /// prior record untouched.
    pub fn save(&self, id: WorkflowId, state: &WorkflowState) -> Result<()> {
        let path = self.record_path(id);
        let tmp = self.root.join(format!("{}.json.tmp", id));

        fs::write(&tmp, serde_json::to_string_pretty(state)?)?;
        fs::rename(&tmp, &path)?;

        clog_trace!("StateStore::save {} stage={}", id.short(), state.stage());
        Ok(())
    }

    /// Every workflow id with a record on disk.
    pub fn list(&self) -> Result<Vec<WorkflowId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(id) = stem.parse::<WorkflowId>() {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn lock_for(&self, id: WorkflowId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("state lock map poisoned");
        Arc::clone(locks.entry(id).or_default())
    }

    /// Open an exclusive read-modify-write transaction on `id`.
    ///
    /// Blocks up to the configured lock timeout waiting for any other
    /// transaction on the same id, then fails with `LockTimeoutError`.
    /// The returned transaction persists only on [`Transaction::commit`];
    /// dropping it discards every mutation and the prior record stays
    /// authoritative.
    pub async fn transaction(&self, id: WorkflowId) -> Result<Transaction<'_>> {
        let lock = self.lock_for(id);
        let guard = tokio::time::timeout(self.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| Error::LockTimeout {
                id,
                waited: self.lock_timeout,
            })?;

        let state = self.load(id)?;
        clog_debug!("transaction opened for workflow {}", id.short());

        Ok(Transaction {
            store: self,
            id,
            state,
            _guard: guard,
        })
    }
}

/// A scoped read-modify-write transaction on one workflow record.
///
/// Holds the per-id lock for its lifetime. Nothing reaches disk until
/// `commit()`; an early return or error path that drops the
/// transaction leaves the stored record exactly as it was.
#[derive(Debug)]
pub struct Transaction<'a> {
    store: &'a StateStore,
    id: WorkflowId,
    state: WorkflowState,
    _guard: OwnedMutexGuard<()>,
}

impl Transaction<'_> {
    /// The workflow this transaction is scoped to.
    pub fn id(&self) -> WorkflowId {
        self.id
    }

    /// Read access to the in-transaction state.
    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// Mutable access to the in-transaction state.
    pub fn state_mut(&mut self) -> &mut WorkflowState {
        &mut self.state
    }

    /// Persist the mutated state atomically and release the lock.
    pub fn commit(mut self) -> Result<()> {
        self.state.touch();
        self.store.save(self.id, &self.state)
    }
}
