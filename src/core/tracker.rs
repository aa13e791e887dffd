//! Dependency graph and task tracker.
//!
//! The tracker owns every task of one plan and the dependency edges
//! between them. Dependencies are declared freely at registration and
//! checked eagerly by [`TaskTracker::validate`] - cycle detection and
//! dangling-reference checks run before any scheduling call, never
//! lazily during execution.

use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, GraphError, Result};

/// Tracks one plan's tasks and their dependency graph.
///
/// Nodes are tasks; an edge `a -> b` means `b` depends on `a`. The
/// tracker must be validated after registration and before any
/// scheduling query.
pub struct TaskTracker {
    /// The underlying directed graph.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    index: HashMap<TaskId, NodeIndex>,
    /// Set by `validate()`, cleared by any registration.
    validated: bool,
}

impl TaskTracker {
    /// Create a new empty tracker.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
            validated: false,
        }
    }

    /// Register a task and its declared dependencies.
    ///
    /// Dependencies are not checked here - they may reference tasks
    /// registered later. Registration of an already-known id fails.
    pub fn add_task(&mut self, task: Task) -> Result<()> {
        if self.index.contains_key(&task.id) {
            return Err(GraphError::DuplicateTask(task.id).into());
        }
        let id = task.id;
        let node = self.graph.add_node(task);
        self.index.insert(id, node);
        self.validated = false;
        Ok(())
    }

    /// Validate the graph: every declared dependency must exist and the
    /// graph must be acyclic.
    ///
    /// On failure the error names every missing reference, or every
    /// task id that sits on at least one cycle. Must succeed before any
    /// scheduling call.
    pub fn validate(&mut self) -> Result<()> {
        // Dangling references first - edges can only be built once every
        // endpoint exists.
        let mut dangling = Vec::new();
        for node in self.graph.node_indices() {
            let task = &self.graph[node];
            for dep in &task.depends_on {
                if !self.index.contains_key(dep) {
                    dangling.push((task.id, *dep));
                }
            }
        }
        if !dangling.is_empty() {
            return Err(GraphError::DanglingReferences { refs: dangling }.into());
        }

        // Rebuild edges from the declared dependency lists.
        self.graph.clear_edges();
        for node in self.graph.node_indices() {
            let deps = self.graph[node].depends_on.clone();
            for dep in deps {
                let dep_node = self.index[&dep];
                self.graph.add_edge(dep_node, node, ());
            }
        }

        // Strongly connected components of size > 1 are cycles, as is a
        // single node depending on itself.
        let mut cycles: Vec<Vec<TaskId>> = Vec::new();
        for scc in tarjan_scc(&self.graph) {
            let is_cycle = scc.len() > 1
                || (scc.len() == 1 && self.graph.find_edge(scc[0], scc[0]).is_some());
            if is_cycle {
                cycles.push(scc.iter().map(|n| self.graph[*n].id).collect());
            }
        }
        if !cycles.is_empty() {
            return Err(GraphError::Cycles { cycles }.into());
        }

        self.validated = true;
        Ok(())
    }

    fn ensure_validated(&self) -> Result<()> {
        if self.validated {
            Ok(())
        } else {
            Err(GraphError::NotValidated.into())
        }
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.index.get(id).map(|&node| &self.graph[node])
    }

    /// Get a mutable reference to a task by its ID.
    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        if let Some(&node) = self.index.get(id) {
            Some(&mut self.graph[node])
        } else {
            None
        }
    }

    /// All tasks in registration order.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.graph
            .node_indices()
            .map(|node| &self.graph[node])
            .collect()
    }

    /// Number of registered tasks.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Check if the tracker contains a task.
    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Check if the tracker is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    fn dep_completed(&self, dep: NodeIndex) -> bool {
        matches!(self.graph[dep].status, TaskStatus::Completed)
    }

    fn dep_failed(&self, dep: NodeIndex) -> bool {
        matches!(self.graph[dep].status, TaskStatus::Failed { .. })
    }

    /// Every startable task whose dependencies are all completed, in
    /// deterministic registration order.
    ///
    /// Blocked, running, and finished tasks are never returned; a task
    /// with a failed dependency is excluded forever.
    pub fn ready_tasks(&self) -> Result<Vec<&Task>> {
        self.ensure_validated()?;
        Ok(self
            .graph
            .node_indices()
            .filter(|&node| {
                let task = &self.graph[node];
                if !task.can_start() {
                    return false;
                }
                self.graph
                    .neighbors_directed(node, Direction::Incoming)
                    .all(|dep| self.dep_completed(dep))
            })
            .map(|node| &self.graph[node])
            .collect())
    }

    /// Tasks that cannot run because at least one dependency failed.
    ///
    /// Blocked tasks stay queryable but are excluded from
    /// `ready_tasks()` forever.
    pub fn blocked_tasks(&self) -> Result<Vec<&Task>> {
        self.ensure_validated()?;
        Ok(self
            .graph
            .node_indices()
            .filter(|&node| {
                let task = &self.graph[node];
                matches!(task.status, TaskStatus::Blocked { .. })
                    || (!task.is_finished()
                        && self
                            .graph
                            .neighbors_directed(node, Direction::Incoming)
                            .any(|dep| self.dep_failed(dep)))
            })
            .map(|node| &self.graph[node])
            .collect())
    }

    /// Partition the full task set into an ordered sequence of
    /// parallel-safe batches via repeated ready-set extraction.
    ///
    /// Each task appears exactly once, and all of its dependencies sit
    /// in a strictly earlier batch.
    pub fn execution_batches(&self) -> Result<Vec<Vec<TaskId>>> {
        self.ensure_validated()?;

        let total = self.graph.node_count();
        let mut done: HashSet<TaskId> = HashSet::new();
        let mut batches = Vec::new();

        while done.len() < total {
            let batch: Vec<TaskId> = self
                .graph
                .node_indices()
                .filter(|&node| {
                    let task = &self.graph[node];
                    !done.contains(&task.id)
                        && self
                            .graph
                            .neighbors_directed(node, Direction::Incoming)
                            .all(|dep| done.contains(&self.graph[dep].id))
                })
                .map(|node| self.graph[node].id)
                .collect();

            if batch.is_empty() {
                // Unreachable after validate(), which rejects cycles.
                return Err(Error::Validation(
                    "batching stalled on a validated graph".to_string(),
                ));
            }

            done.extend(batch.iter().copied());
            batches.push(batch);
        }

        Ok(batches)
    }

    /// Tasks in dependency order (batches flattened).
    pub fn dependency_order(&self) -> Result<Vec<TaskId>> {
        Ok(self.execution_batches()?.into_iter().flatten().collect())
    }

    /// Mark a task as running.
    pub fn mark_running(&mut self, id: &TaskId) -> Result<()> {
        let task = self
            .get_task_mut(id)
            .ok_or(GraphError::TaskNotFound(*id))?;
        task.start();
        Ok(())
    }

    /// Mark a task as completed, recording its result payload.
    ///
    /// Dependents whose dependencies are now all completed are promoted
    /// from Pending to Ready.
    pub fn mark_completed(&mut self, id: &TaskId, result: Option<serde_json::Value>) -> Result<()> {
        let node = *self.index.get(id).ok_or(GraphError::TaskNotFound(*id))?;
        {
            let task = &mut self.graph[node];
            task.complete();
            if let Some(value) = result {
                task.set_result(value);
            }
        }

        let dependents: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect();
        for dependent in dependents {
            let all_done = self
                .graph
                .neighbors_directed(dependent, Direction::Incoming)
                .all(|dep| self.dep_completed(dep));
            let task = &mut self.graph[dependent];
            if all_done && matches!(task.status, TaskStatus::Pending) {
                task.mark_ready();
            }
        }
        Ok(())
    }

    /// Mark a task as failed and transitively block every dependent.
    ///
    /// Dependents are never silently dropped: each one that has not
    /// already finished is moved to Blocked with a reason naming the
    /// failed task.
    pub fn mark_failed(&mut self, id: &TaskId, error: &str) -> Result<()> {
        let node = *self.index.get(id).ok_or(GraphError::TaskNotFound(*id))?;
        let failed_name = self.graph[node].name.clone();
        self.graph[node].fail(error);

        let mut queue: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect();
        let mut seen: HashSet<NodeIndex> = queue.iter().copied().collect();

        while let Some(current) = queue.pop() {
            let reason = format!("dependency '{}' failed", failed_name);
            let task = &mut self.graph[current];
            if !task.is_finished() {
                task.block(&reason);
            }
            for next in self.graph.neighbors_directed(current, Direction::Outgoing) {
                if seen.insert(next) {
                    queue.push(next);
                }
            }
        }
        Ok(())
    }

    /// Snapshot of every task's status, keyed by id.
    pub fn statuses(&self) -> BTreeMap<TaskId, TaskStatus> {
        self.graph
            .node_indices()
            .map(|node| {
                let task = &self.graph[node];
                (task.id, task.status.clone())
            })
            .collect()
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskTracker")
            .field("tasks", &self.graph.node_count())
            .field("dependencies", &self.graph.edge_count())
            .field("validated", &self.validated)
            .finish()
    }
}
