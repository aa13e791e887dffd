//! Branch layout strategies for a workflow's tasks.
//!
//! Two layouts exist: one shared branch for the whole plan (tasks
//! commit sequentially), or one branch per task (tasks implement
//! concurrently and an integration branch merges them in dependency
//! order). The mode is a pure function of configuration, resolved once
//! at plan creation and persisted in the workflow state so later
//! stages stay consistent across processes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::collab::{CodeHost, MergeOutcome};
use crate::config::Config;
use crate::core::task::Task;
use crate::error::{Error, Result};
use crate::recovery::{RecoveryCoordinator, RecoveryOutcome};
use crate::workflow::{Stage, WorkflowState};
use crate::{clog, clog_debug};

/// Which branch layout a workflow uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BranchingMode {
    /// One branch for the whole plan; tasks commit sequentially.
    PerPlan,
    /// One branch per task; an integration branch merges them.
    #[default]
    PerAgent,
}

impl BranchingMode {
    /// Resolve the mode from configuration. Pure; called once at plan
    /// creation.
    pub fn select(config: &Config) -> Self {
        config.branching
    }
}

impl std::fmt::Display for BranchingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BranchingMode::PerPlan => write!(f, "per_plan"),
            BranchingMode::PerAgent => write!(f, "per_agent"),
        }
    }
}

/// Strategy over branch creation and integration.
#[async_trait]
pub trait BranchingStrategy: Send + Sync {
    fn mode(&self) -> BranchingMode;

    /// The branch carrying the workflow's combined changes, used for
    /// review diffs and the final pull request.
    fn delivery_branch(&self, state: &WorkflowState) -> String;

    /// Create (or reuse) the branch a task commits to.
    async fn create_task_branch(
        &self,
        host: &dyn CodeHost,
        state: &WorkflowState,
        task: &Task,
    ) -> Result<String>;

    /// Integrate completed task branches, in dependency order.
    ///
    /// Returns the integration commit when a merge happened. Merge
    /// conflicts are routed to the recovery coordinator's
    /// conflict-resolution strategy before this returns success.
    async fn integrate(
        &self,
        host: &dyn CodeHost,
        recovery: &RecoveryCoordinator,
        state: &WorkflowState,
        branches: &[String],
    ) -> Result<Option<String>>;
}

/// Build the strategy for a persisted mode.
pub fn strategy_for(mode: BranchingMode) -> Box<dyn BranchingStrategy> {
    match mode {
        BranchingMode::PerPlan => Box::new(PerPlanBranching),
        BranchingMode::PerAgent => Box::new(PerAgentBranching),
    }
}

fn base_branch(state: &WorkflowState) -> String {
    state
        .metadata
        .get("base_branch")
        .cloned()
        .unwrap_or_else(|| "main".to_string())
}

/// Sanitize a task name into a branch-name segment.
fn slug(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    sanitized.trim_matches('-').to_string()
}

/// One shared branch for the whole plan.
pub struct PerPlanBranching;

impl PerPlanBranching {
    fn plan_branch(state: &WorkflowState) -> String {
        format!("plan/{}", state.id.short())
    }
}

#[async_trait]
impl BranchingStrategy for PerPlanBranching {
    fn mode(&self) -> BranchingMode {
        BranchingMode::PerPlan
    }

    fn delivery_branch(&self, state: &WorkflowState) -> String {
        Self::plan_branch(state)
    }

    async fn create_task_branch(
        &self,
        host: &dyn CodeHost,
        state: &WorkflowState,
        _task: &Task,
    ) -> Result<String> {
        let branch = Self::plan_branch(state);
        host.create_branch(&branch, &base_branch(state)).await?;
        Ok(branch)
    }

    async fn integrate(
        &self,
        _host: &dyn CodeHost,
        _recovery: &RecoveryCoordinator,
        state: &WorkflowState,
        _branches: &[String],
    ) -> Result<Option<String>> {
        // Tasks already committed sequentially on the plan branch.
        clog_debug!(
            "per-plan workflow {} needs no integration",
            state.id.short()
        );
        Ok(None)
    }
}

/// One branch per task, merged through an integration branch.
pub struct PerAgentBranching;

impl PerAgentBranching {
    fn integration_branch(state: &WorkflowState) -> String {
        format!("integration/{}", state.id.short())
    }
}

#[async_trait]
impl BranchingStrategy for PerAgentBranching {
    fn mode(&self) -> BranchingMode {
        BranchingMode::PerAgent
    }

    fn delivery_branch(&self, state: &WorkflowState) -> String {
        Self::integration_branch(state)
    }

    async fn create_task_branch(
        &self,
        host: &dyn CodeHost,
        state: &WorkflowState,
        task: &Task,
    ) -> Result<String> {
        let branch = format!("task/{}-{}", task.id.short(), slug(&task.name));
        host.create_branch(&branch, &base_branch(state)).await?;
        Ok(branch)
    }

    async fn integrate(
        &self,
        host: &dyn CodeHost,
        recovery: &RecoveryCoordinator,
        state: &WorkflowState,
        branches: &[String],
    ) -> Result<Option<String>> {
        let integration = Self::integration_branch(state);
        host.create_branch(&integration, &base_branch(state)).await?;

        let mut last_commit = None;
        for branch in branches {
            clog_debug!("merging {} into {}", branch, integration);
            match host.merge_branch(&integration, branch).await? {
                MergeOutcome::Merged { commit } => {
                    last_commit = Some(commit);
                }
                MergeOutcome::Conflict { diff } => {
                    clog!(
                        "conflict merging {} into {} for workflow {}",
                        branch,
                        integration,
                        state.id.short()
                    );
                    let conflict = Error::MergeConflict {
                        base: integration.clone(),
                        head: branch.clone(),
                        diff,
                    };
                    let outcome = recovery.handle(state.id, Stage::Merge, &conflict).await?;
                    if outcome != RecoveryOutcome::Resolved {
                        return Err(conflict);
                    }

                    // The resolution merged on our behalf; re-merging
                    // must now be a no-op that yields the new head.
                    match host.merge_branch(&integration, branch).await? {
                        MergeOutcome::Merged { commit } => {
                            last_commit = Some(commit);
                        }
                        MergeOutcome::Conflict { diff } => {
                            return Err(Error::MergeConflict {
                                base: integration.clone(),
                                head: branch.clone(),
                                diff,
                            });
                        }
                    }
                }
            }
        }

        Ok(last_commit)
    }
}
