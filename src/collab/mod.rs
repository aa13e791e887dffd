//! External collaborator interfaces.
//!
//! The orchestration core consumes these interfaces and never
//! implements them: the code host wraps a hosting service's API, the
//! coding agent wraps an AI implementation backend, and the status
//! reporter delivers human-readable notices. Concrete implementations
//! live with the embedding application.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::task::{Task, TaskId};
use crate::error::Result;
use crate::workflow::WorkflowId;

/// Failures surfaced by the code-hosting collaborator.
///
/// Deliberately a small discriminated set so recovery can classify
/// them: not-found and auth need operator action, rate limits and
/// network errors are transient.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("network error: {0}")]
    Network(String),
}

/// Outcome of asking the host to merge one branch into another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum MergeOutcome {
    /// Merge completed (or the branch was already merged); `commit` is
    /// the resulting head of the base branch.
    Merged { commit: String },
    /// The merge cannot complete automatically; `diff` carries the
    /// conflicting hunks for resolution.
    Conflict { diff: String },
}

impl MergeOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, MergeOutcome::Merged { .. })
    }
}

/// An issue on the code host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// A plan generated from an issue.
///
/// The plan id doubles as the workflow id: one plan is one workflow.
/// The orchestrator assigns the id after generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: WorkflowId,
    pub summary: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(summary: &str, body: &str) -> Self {
        Self {
            id: WorkflowId::new(),
            summary: summary.to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Result of one task execution by the coding agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task: TaskId,
    pub summary: String,
    pub commit: Option<String>,
}

/// Outcome of a code review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub approved: bool,
    pub feedback: String,
}

/// Everything the agent needs to resolve one merge conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictInfo {
    /// The branch being merged into.
    pub base: String,
    /// The branch being merged.
    pub head: String,
    /// The conflicting hunks.
    pub diff: String,
}

/// A conflict resolution produced by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    /// Commit message for the resolution.
    pub message: String,
    /// The resolved content as a patch against the base branch.
    pub patch: String,
}

/// The code-hosting collaborator: issues, branches, merges, PRs.
///
/// Branch creation is idempotent - creating a branch that already
/// exists reuses it and returns Ok. Merging an already-merged branch
/// yields `MergeOutcome::Merged` with the current base head.
#[async_trait]
pub trait CodeHost: Send + Sync {
    async fn get_issue(&self, number: u64) -> std::result::Result<Issue, HostError>;

    async fn create_issue(
        &self,
        title: &str,
        body: &str,
    ) -> std::result::Result<Issue, HostError>;

    async fn add_label(&self, number: u64, label: &str) -> std::result::Result<(), HostError>;

    async fn comment(&self, number: u64, body: &str) -> std::result::Result<(), HostError>;

    async fn create_branch(&self, name: &str, from: &str) -> std::result::Result<(), HostError>;

    /// Unified diff of `head` relative to `base`.
    async fn branch_diff(
        &self,
        base: &str,
        head: &str,
    ) -> std::result::Result<String, HostError>;

    async fn merge_branch(
        &self,
        base: &str,
        head: &str,
    ) -> std::result::Result<MergeOutcome, HostError>;

    /// Complete a conflicted merge using an agent-produced resolution.
    async fn merge_with_resolution(
        &self,
        base: &str,
        head: &str,
        resolution: &Resolution,
    ) -> std::result::Result<MergeOutcome, HostError>;

    /// Open a pull request; returns its number.
    async fn create_pull_request(
        &self,
        title: &str,
        body: &str,
        base: &str,
        head: &str,
    ) -> std::result::Result<u64, HostError>;
}

/// The AI coding agent collaborator.
///
/// Every call is opaque and timeout-bounded by the caller; failures
/// surface as `Error::AgentCall` or `Error::Timeout`.
#[async_trait]
pub trait CodingAgent: Send + Sync {
    /// Generate an implementation plan from an issue.
    async fn generate_plan(&self, issue: &Issue) -> Result<Plan>;

    /// Decompose a plan into implementation tasks with declared
    /// dependencies.
    async fn generate_prompts(&self, plan: &Plan) -> Result<Vec<Task>>;

    /// Execute one task; `context` carries the plan body plus any
    /// prior failure output.
    async fn execute_task(&self, task: &Task, context: &str) -> Result<TaskResult>;

    /// Review a diff.
    async fn review_code(&self, diff: &str, context: &str) -> Result<Review>;

    /// Resolve a merge conflict.
    async fn resolve_conflict(&self, info: &ConflictInfo) -> Result<Resolution>;
}

/// The status-reporting collaborator for human-readable notices.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn progress(&self, workflow: WorkflowId, message: &str) -> Result<()>;

    async fn failure(&self, workflow: WorkflowId, message: &str) -> Result<()>;
}
