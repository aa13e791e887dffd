use std::time::Duration;

use thiserror::Error;

use crate::collab::HostError;
use crate::core::task::TaskId;
use crate::executor::StuckTask;
use crate::workflow::{Stage, WorkflowId};

/// Errors raised during dependency graph construction and validation.
///
/// Graph errors are fatal to plan creation: a workflow whose task graph
/// fails validation never reaches execution.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("task already registered: {0}")]
    DuplicateTask(TaskId),

    #[error("task not found in graph: {0}")]
    TaskNotFound(TaskId),

    #[error("dangling dependency references: {}", format_dangling(.refs))]
    DanglingReferences { refs: Vec<(TaskId, TaskId)> },

    #[error("dependency cycles detected: {}", format_cycles(.cycles))]
    Cycles { cycles: Vec<Vec<TaskId>> },

    #[error("graph must be validated before scheduling")]
    NotValidated,
}

fn format_dangling(refs: &[(TaskId, TaskId)]) -> String {
    refs.iter()
        .map(|(task, missing)| format!("{} -> {}", task, missing))
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_cycles(cycles: &[Vec<TaskId>]) -> String {
    cycles
        .iter()
        .map(|cycle| {
            let ids: Vec<String> = cycle.iter().map(|id| id.to_string()).collect();
            format!("[{}]", ids.join(" -> "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_stuck(stuck: &[StuckTask]) -> String {
    stuck
        .iter()
        .map(|t| format!("{} (waiting on: {})", t.id, t.unmet.join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("state record for workflow {id} is corrupt: {detail}")]
    StateCorruption { id: WorkflowId, detail: String },

    #[error("timed out after {waited:?} waiting for the state lock of workflow {id}")]
    LockTimeout { id: WorkflowId, waited: Duration },

    #[error("invalid stage transition from {from} to {to}")]
    StageSequence { from: Stage, to: Stage },

    #[error("workflow {id} already has stage {stage} in flight")]
    StageInProgress { id: WorkflowId, stage: Stage },

    #[error("workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("task execution failed: {task}: {message}")]
    TaskExecution { task: String, message: String },

    #[error("execution deadlocked: {}", format_stuck(.stuck))]
    Deadlock { stuck: Vec<StuckTask> },

    #[error("code host error: {0}")]
    Host(#[from] HostError),

    #[error("agent call failed: {0}")]
    AgentCall(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("merge conflict merging {head} into {base}")]
    MergeConflict {
        base: String,
        head: String,
        diff: String,
    },

    #[error("review failed for workflow {workflow} at {stage}")]
    TestsFailed {
        workflow: WorkflowId,
        stage: Stage,
        output: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Whether this error is transient and worth retrying.
    ///
    /// Transient errors are network hiccups, rate limits, timeouts, and
    /// contended state locks. Everything else needs a smarter remedy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Host(HostError::Network(_))
                | Error::Host(HostError::RateLimited { .. })
                | Error::Timeout(_)
                | Error::LockTimeout { .. }
        )
    }

    /// A short stable label for the error kind, used in recovery
    /// failure signatures and log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::TomlParse(_) => "toml_parse",
            Error::TomlSerialize(_) => "toml_serialize",
            Error::NoHomeDir => "no_home_dir",
            Error::Graph(_) => "graph",
            Error::StateCorruption { .. } => "state_corruption",
            Error::LockTimeout { .. } => "lock_timeout",
            Error::StageSequence { .. } => "stage_sequence",
            Error::StageInProgress { .. } => "stage_in_progress",
            Error::WorkflowNotFound(_) => "workflow_not_found",
            Error::TaskExecution { .. } => "task_execution",
            Error::Deadlock { .. } => "deadlock",
            Error::Host(HostError::NotFound(_)) => "host_not_found",
            Error::Host(HostError::Auth(_)) => "host_auth",
            Error::Host(HostError::RateLimited { .. }) => "host_rate_limited",
            Error::Host(HostError::Network(_)) => "host_network",
            Error::AgentCall(_) => "agent_call",
            Error::Timeout(_) => "timeout",
            Error::MergeConflict { .. } => "merge_conflict",
            Error::TestsFailed { .. } => "tests_failed",
            Error::Validation(_) => "validation",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
