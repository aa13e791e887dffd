//! Task data model.
//!
//! Tasks are the atomic units of implementation work decomposed from a
//! plan. Each task declares the tasks it depends on and tracks its
//! status, result payload, and timing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::WorkflowId;

/// Unique identifier for a task within a plan.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task status in its lifecycle.
///
/// A task becomes Ready only once every dependency has completed, and
/// Blocked once any dependency has permanently failed. Completed and
/// Failed are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Task created but dependencies not yet satisfied.
    Pending,
    /// All dependencies completed, ready to be scheduled.
    Ready,
    /// Task is currently being executed.
    Running,
    /// Task completed successfully.
    Completed,
    /// Task failed with an error.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
    /// Task cannot proceed because a dependency failed.
    Blocked {
        /// Reason why the task is blocked.
        reason: String,
    },
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
        }
    }
}

/// A single unit of implementation work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// The plan (workflow) this task belongs to.
    pub plan_id: WorkflowId,
    /// Human-readable name for the task.
    pub name: String,
    /// Detailed description of what the task should accomplish.
    pub description: String,
    /// Declared dependencies. Unvalidated at creation; the tracker
    /// checks them during graph validation.
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Current execution status.
    pub status: TaskStatus,
    /// Result payload recorded on completion.
    pub result: Option<serde_json::Value>,
    /// Branch the task's work lands on, once assigned.
    pub branch: Option<String>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task started execution.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task completed (success or failure).
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task owned by the given plan.
    pub fn new(plan_id: WorkflowId, name: &str, description: &str) -> Self {
        Self {
            id: TaskId::new(),
            plan_id,
            name: name.to_string(),
            description: description.to_string(),
            depends_on: Vec::new(),
            status: TaskStatus::Pending,
            result: None,
            branch: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Start the task execution.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Mark the task as successfully completed.
    pub fn complete(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task as failed with an error message.
    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed {
            error: error.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task as ready for execution.
    pub fn mark_ready(&mut self) {
        self.status = TaskStatus::Ready;
    }

    /// Mark the task as blocked.
    pub fn block(&mut self, reason: &str) {
        self.status = TaskStatus::Blocked {
            reason: reason.to_string(),
        };
    }

    /// Record the result payload from the task's work.
    pub fn set_result(&mut self, result: serde_json::Value) {
        self.result = Some(result);
    }

    /// Set the branch this task commits to.
    pub fn set_branch(&mut self, branch: &str) {
        self.branch = Some(branch.to_string());
    }

    /// Check if the task is in a terminal state (Completed or Failed).
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed { .. }
        )
    }

    /// Check if the task can be started (Pending or Ready).
    pub fn can_start(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Ready)
    }
}
