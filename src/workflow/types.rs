//! Core workflow type definitions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a workflow (equivalently, its plan).
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    /// Create a new unique workflow identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkflowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Stages of the workflow pipeline, in order:
///
/// Planning -> PlanReview -> Implementation -> CodeReview -> Merge -> Completed
///
/// The transition table is static: a stage may only be entered from its
/// immediate predecessor. Failure and blocking are tracked orthogonally
/// by [`WorkflowStatus`], reachable from any stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Generate an implementation plan from the source issue.
    Planning,
    /// Publish the plan for review and approval.
    PlanReview,
    /// Decompose into tasks and execute them in parallel.
    Implementation,
    /// Review the combined changes.
    CodeReview,
    /// Integrate task branches and open the pull request.
    Merge,
    /// Terminal stage.
    Completed,
}

impl Stage {
    /// Every stage in pipeline order.
    pub const ALL: [Stage; 6] = [
        Stage::Planning,
        Stage::PlanReview,
        Stage::Implementation,
        Stage::CodeReview,
        Stage::Merge,
        Stage::Completed,
    ];

    /// The stage that follows this one, if any.
    pub fn successor(&self) -> Option<Stage> {
        match self {
            Stage::Planning => Some(Stage::PlanReview),
            Stage::PlanReview => Some(Stage::Implementation),
            Stage::Implementation => Some(Stage::CodeReview),
            Stage::CodeReview => Some(Stage::Merge),
            Stage::Merge => Some(Stage::Completed),
            Stage::Completed => None,
        }
    }

    /// Whether this is the terminal stage.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Planning => write!(f, "planning"),
            Stage::PlanReview => write!(f, "plan_review"),
            Stage::Implementation => write!(f, "implementation"),
            Stage::CodeReview => write!(f, "code_review"),
            Stage::Merge => write!(f, "merge"),
            Stage::Completed => write!(f, "completed"),
        }
    }
}

/// Lifecycle status of a workflow, orthogonal to its stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Idle between stages.
    #[default]
    Pending,
    /// A stage is currently executing.
    Running,
    /// Escalated to manual intervention; waits for external action.
    Paused,
    /// A stage failed and recovery could not resolve it.
    Failed,
    /// Tasks are blocked on a failed dependency.
    Blocked,
    /// All stages finished.
    Completed,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Paused => write!(f, "paused"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Blocked => write!(f, "blocked"),
            WorkflowStatus::Completed => write!(f, "completed"),
        }
    }
}

/// Status of one stage execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::InProgress => write!(f, "in_progress"),
            StageStatus::Completed => write!(f, "completed"),
            StageStatus::Failed => write!(f, "failed"),
        }
    }
}
