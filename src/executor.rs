//! Bounded parallel execution of dependent async tasks.
//!
//! The executor is domain-agnostic: an [`ExecutionTask`] is just an id,
//! an async work item, declared dependencies within the batch, a
//! priority, and an optional timeout. The loop launches up to
//! `max_workers` ready tasks, waits for at least one completion before
//! re-evaluating, skips the dependents of failures without launching
//! them, and fails fast on structural deadlock.
//!
//! Individual task failures never raise: they land in the returned
//! outcome map. Only structural problems (bad configuration, unknown
//! dependency ids, deadlock) surface as errors.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::JoinSet;

use crate::error::{Error, Result};
use crate::{clog_debug, clog_warn};

type BoxWork = Box<dyn FnOnce() -> BoxFuture<'static, Result<serde_json::Value>> + Send>;

/// One unit of work for the executor.
pub struct ExecutionTask {
    /// Unique id within the batch.
    pub id: String,
    /// Ids of tasks in the same batch that must complete first.
    pub depends_on: Vec<String>,
    /// Higher priority launches first among simultaneously-ready tasks.
    pub priority: i64,
    /// Cancels only this task when exceeded.
    pub timeout: Option<Duration>,
    work: BoxWork,
}

impl ExecutionTask {
    /// Create a task from an async work closure.
    pub fn new<F, Fut>(id: impl Into<String>, work: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            priority: 0,
            timeout: None,
            work: Box::new(move || work().boxed()),
        }
    }

    /// Declare dependencies within the batch.
    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }

    /// Set the launch priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the per-task timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for ExecutionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionTask")
            .field("id", &self.id)
            .field("depends_on", &self.depends_on)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Terminal outcome of one task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The work item returned successfully.
    Completed(serde_json::Value),
    /// The work item returned an error or panicked.
    Failed(String),
    /// The per-task timeout elapsed; only this task was cancelled.
    TimedOut(Duration),
    /// Never launched: a dependency failed, timed out, or was itself
    /// skipped.
    Skipped { unmet: Vec<String> },
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed(_))
    }

    /// Failed or timed out (skipped tasks never ran at all).
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskOutcome::Failed(_) | TaskOutcome::TimedOut(_))
    }
}

/// A task that can never run, reported by deadlock detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckTask {
    pub id: String,
    /// Dependencies that are not completed and never will be.
    pub unmet: Vec<String>,
}

/// Concurrency-limited executor over one batch of tasks.
pub struct ParallelExecutor {
    max_workers: usize,
}

impl ParallelExecutor {
    pub fn new(max_workers: usize) -> Self {
        Self { max_workers }
    }

    /// Run the batch to completion and return the per-task outcome map.
    ///
    /// Raises only for structural errors: zero workers, duplicate ids,
    /// dependencies on unknown ids, or a deadlocked dependency graph.
    pub async fn execute(
        &self,
        tasks: Vec<ExecutionTask>,
    ) -> Result<HashMap<String, TaskOutcome>> {
        if self.max_workers == 0 {
            return Err(Error::Validation(
                "max_workers must be at least 1".to_string(),
            ));
        }

        let mut known = HashSet::new();
        for task in &tasks {
            if !known.insert(task.id.clone()) {
                return Err(Error::Validation(format!(
                    "duplicate task id in batch: {}",
                    task.id
                )));
            }
        }
        for task in &tasks {
            for dep in &task.depends_on {
                if !known.contains(dep) {
                    return Err(Error::Validation(format!(
                        "task {} depends on unknown task {}",
                        task.id, dep
                    )));
                }
            }
        }

        let mut pending = tasks;
        let mut outcomes: HashMap<String, TaskOutcome> = HashMap::new();
        let mut in_flight: JoinSet<(String, TaskOutcome)> = JoinSet::new();
        let mut spawned: HashMap<tokio::task::Id, String> = HashMap::new();

        loop {
            // Skip cascade: dependents of failed, timed-out, or skipped
            // tasks are marked skipped and never launched.
            loop {
                let mut changed = false;
                let mut i = 0;
                while i < pending.len() {
                    let unmet: Vec<String> = pending[i]
                        .depends_on
                        .iter()
                        .filter(|dep| {
                            matches!(
                                outcomes.get(dep.as_str()),
                                Some(TaskOutcome::Failed(_))
                                    | Some(TaskOutcome::TimedOut(_))
                                    | Some(TaskOutcome::Skipped { .. })
                            )
                        })
                        .cloned()
                        .collect();
                    if unmet.is_empty() {
                        i += 1;
                        continue;
                    }
                    let task = pending.remove(i);
                    clog_warn!("skipping {}: unmet dependencies {:?}", task.id, unmet);
                    outcomes.insert(task.id, TaskOutcome::Skipped { unmet });
                    changed = true;
                }
                if !changed {
                    break;
                }
            }

            // Ready tasks, highest priority first with stable id tie-break.
            let mut ready: Vec<usize> = (0..pending.len())
                .filter(|&i| {
                    pending[i].depends_on.iter().all(|dep| {
                        matches!(
                            outcomes.get(dep.as_str()),
                            Some(TaskOutcome::Completed(_))
                        )
                    })
                })
                .collect();
            ready.sort_by(|&a, &b| {
                pending[b]
                    .priority
                    .cmp(&pending[a].priority)
                    .then_with(|| pending[a].id.cmp(&pending[b].id))
            });

            let slots = self.max_workers.saturating_sub(in_flight.len());
            let mut launch: Vec<usize> = ready.into_iter().take(slots).collect();
            launch.sort_unstable();
            for i in launch.into_iter().rev() {
                let task = pending.remove(i);
                clog_debug!("launching task {} (priority {})", task.id, task.priority);
                let id = task.id.clone();
                let limit = task.timeout;
                let fut = (task.work)();
                let handle = in_flight.spawn(async move {
                    let result = match limit {
                        Some(limit) => match tokio::time::timeout(limit, fut).await {
                            Ok(inner) => inner,
                            Err(_) => return (id, TaskOutcome::TimedOut(limit)),
                        },
                        None => fut.await,
                    };
                    match result {
                        Ok(value) => (id, TaskOutcome::Completed(value)),
                        Err(e) => (id, TaskOutcome::Failed(e.to_string())),
                    }
                });
                spawned.insert(handle.id(), task.id);
            }

            if pending.is_empty() && in_flight.is_empty() {
                break;
            }

            if in_flight.is_empty() {
                // Nothing running and nothing launchable: the remaining
                // tasks can never run.
                let stuck = pending
                    .iter()
                    .map(|task| StuckTask {
                        id: task.id.clone(),
                        unmet: task
                            .depends_on
                            .iter()
                            .filter(|dep| {
                                !matches!(
                                    outcomes.get(dep.as_str()),
                                    Some(TaskOutcome::Completed(_))
                                )
                            })
                            .cloned()
                            .collect(),
                    })
                    .collect();
                return Err(Error::Deadlock { stuck });
            }

            // Await at least one completion before re-evaluating.
            if let Some(joined) = in_flight.join_next_with_id().await {
                match joined {
                    Ok((join_id, (task_id, outcome))) => {
                        spawned.remove(&join_id);
                        if outcome.is_failure() {
                            clog_warn!("task {} finished with {:?}", task_id, outcome);
                        }
                        outcomes.insert(task_id, outcome);
                    }
                    Err(join_err) => {
                        let task_id = spawned
                            .remove(&join_err.id())
                            .unwrap_or_else(|| "unknown".to_string());
                        outcomes.insert(
                            task_id,
                            TaskOutcome::Failed(format!("task panicked: {}", join_err)),
                        );
                    }
                }
            }
        }

        Ok(outcomes)
    }
}
