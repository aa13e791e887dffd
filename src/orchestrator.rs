//! The workflow orchestrator: a stage state machine over the state
//! store, checkpoint log, task tracker, executor, branching strategy,
//! and recovery coordinator.
//!
//! Every dependency arrives through the constructor - there is no
//! module-level state. `process` validates the requested stage against
//! the persisted record, executes it with no state lock held across
//! collaborator calls, checkpoints on success, and hands failures to
//! the recovery coordinator. `process_all` isolates per-workflow
//! failures so one broken workflow never aborts the rest.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::branching::{strategy_for, BranchingMode, BranchingStrategy};
use crate::collab::{CodeHost, CodingAgent, Plan, StatusReporter};
use crate::config::Config;
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::core::tracker::TaskTracker;
use crate::error::{Error, Result};
use crate::executor::{ExecutionTask, ParallelExecutor, TaskOutcome};
use crate::recovery::{RecoveryCoordinator, RecoveryOutcome};
use crate::state::{CheckpointStore, StateStore};
use crate::workflow::{Stage, WorkflowId, WorkflowState, WorkflowStatus};
use crate::{clog, clog_debug, clog_error, clog_warn};

/// Checkpoint payload of the implementation stage: everything the
/// review and merge stages need.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImplementationRecord {
    /// Task ids in dependency order.
    order: Vec<TaskId>,
    /// Branch each task committed to.
    branches: BTreeMap<TaskId, String>,
    /// Tasks that completed successfully.
    completed: Vec<TaskId>,
    /// Tasks that failed (dependents of these were blocked).
    failed: Vec<TaskId>,
}

/// Aggregated result of `process_all`.
#[derive(Debug, Default)]
pub struct ProcessSummary {
    pub succeeded: Vec<WorkflowId>,
    pub skipped: Vec<WorkflowId>,
    pub failed: Vec<(WorkflowId, String)>,
}

impl ProcessSummary {
    /// Maps to the caller's exit code: true means exit 0.
    pub fn all_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Top-level coordinator for plan-driven workflows.
pub struct Orchestrator {
    store: Arc<StateStore>,
    checkpoints: Arc<CheckpointStore>,
    recovery: Arc<RecoveryCoordinator>,
    host: Arc<dyn CodeHost>,
    agent: Arc<dyn CodingAgent>,
    reporter: Arc<dyn StatusReporter>,
    config: Config,
}

impl Orchestrator {
    /// Every collaborator and store is injected; the orchestrator owns
    /// no global state.
    pub fn new(
        store: Arc<StateStore>,
        checkpoints: Arc<CheckpointStore>,
        recovery: Arc<RecoveryCoordinator>,
        host: Arc<dyn CodeHost>,
        agent: Arc<dyn CodingAgent>,
        reporter: Arc<dyn StatusReporter>,
        config: Config,
    ) -> Self {
        Self {
            store,
            checkpoints,
            recovery,
            host,
            agent,
            reporter,
            config,
        }
    }

    /// Create a workflow for an issue. The branching mode is resolved
    /// from configuration here, once, and persisted so every later
    /// stage sees the same layout.
    pub async fn create_workflow(&self, issue: u64, labels: Vec<String>) -> Result<WorkflowId> {
        let id = WorkflowId::new();
        let mut tx = self.store.transaction(id).await?;
        {
            let state = tx.state_mut();
            state.issue = Some(issue);
            state.labels = labels;
            state.branching = BranchingMode::select(&self.config);
            state
                .metadata
                .insert("base_branch".to_string(), self.config.base_branch.clone());
        }
        tx.commit()?;

        clog!("created workflow {} for issue #{}", id.short(), issue);
        Ok(id)
    }

    /// Execute `target` for one workflow.
    ///
    /// The requested stage must be legal from the persisted stage; an
    /// out-of-order request fails with `StageSequenceError` and writes
    /// nothing. Stage execution happens without the state lock held;
    /// the persisted Running status keeps a workflow's stages strictly
    /// sequential.
    pub async fn process(&self, id: WorkflowId, target: Stage) -> Result<()> {
        if !self.store.exists(id) {
            return Err(Error::WorkflowNotFound(id));
        }

        {
            let mut tx = self.store.transaction(id).await?;
            if tx.state().status == WorkflowStatus::Running {
                return Err(Error::StageInProgress {
                    id,
                    stage: tx.state().stage(),
                });
            }
            let state = tx.state_mut();
            state.transition(target)?;
            state.begin_stage(target);
            state.status = WorkflowStatus::Running;
            tx.commit()?;
        }

        clog!("workflow {} entering stage {}", id.short(), target);
        match self.execute_stage(id, target).await {
            Ok(data) => self.finish_stage(id, target, data).await,
            Err(error) => self.handle_stage_failure(id, target, error).await,
        }
    }

    /// Advance every stored workflow by one stage, optionally filtered
    /// by label. Failures are isolated per workflow and aggregated.
    pub async fn process_all(&self, filter: Option<&str>) -> Result<ProcessSummary> {
        let mut summary = ProcessSummary::default();

        for id in self.store.list()? {
            let state = match self.store.load(id) {
                Ok(state) => state,
                Err(error) => {
                    clog_error!("cannot load workflow {}: {}", id.short(), error);
                    summary.failed.push((id, error.to_string()));
                    continue;
                }
            };

            if let Some(label) = filter {
                if !state.has_label(label) {
                    summary.skipped.push(id);
                    continue;
                }
            }

            if matches!(
                state.status,
                WorkflowStatus::Running | WorkflowStatus::Paused | WorkflowStatus::Completed
            ) {
                summary.skipped.push(id);
                continue;
            }

            let target = if state.stage_completed(state.stage()) {
                match state.stage().successor() {
                    Some(next) => next,
                    None => {
                        summary.skipped.push(id);
                        continue;
                    }
                }
            } else {
                state.stage()
            };

            match self.process(id, target).await {
                Ok(()) => summary.succeeded.push(id),
                Err(error) => {
                    clog_error!(
                        "workflow {} failed at {}: {}",
                        id.short(),
                        target,
                        error
                    );
                    summary.failed.push((id, error.to_string()));
                }
            }
        }

        Ok(summary)
    }

    async fn execute_stage(&self, id: WorkflowId, stage: Stage) -> Result<serde_json::Value> {
        match stage {
            Stage::Planning => self.run_planning(id).await,
            Stage::PlanReview => self.run_plan_review(id).await,
            Stage::Implementation => self.run_implementation(id).await,
            Stage::CodeReview => self.run_code_review(id).await,
            Stage::Merge => self.run_merge(id).await,
            Stage::Completed => Ok(json!({ "completed": true })),
        }
    }

    /// Checkpoint the stage data, then persist completion.
    async fn finish_stage(
        &self,
        id: WorkflowId,
        stage: Stage,
        data: serde_json::Value,
    ) -> Result<()> {
        self.checkpoints.create(id, stage, data.clone())?;

        let mut tx = self.store.transaction(id).await?;
        {
            let state = tx.state_mut();
            state.finish_stage(stage, Some(data));
            state.status = if stage.is_terminal() {
                WorkflowStatus::Completed
            } else {
                WorkflowStatus::Pending
            };
        }
        tx.commit()?;

        let _ = self
            .reporter
            .progress(id, &format!("stage {} completed", stage))
            .await;
        clog!("workflow {} completed stage {}", id.short(), stage);
        Ok(())
    }

    /// Hand a stage failure to recovery; re-run the stage once if it
    /// resolves, otherwise persist the failure.
    async fn handle_stage_failure(
        &self,
        id: WorkflowId,
        stage: Stage,
        error: Error,
    ) -> Result<()> {
        clog_warn!(
            "workflow {} stage {} failed: {} ({})",
            id.short(),
            stage,
            error,
            error.kind()
        );

        match self.recovery.handle(id, stage, &error).await? {
            RecoveryOutcome::Resolved => {
                clog!(
                    "workflow {} stage {} recovered, re-running",
                    id.short(),
                    stage
                );
                match self.execute_stage(id, stage).await {
                    Ok(data) => self.finish_stage(id, stage, data).await,
                    Err(second) => {
                        self.record_failure(id, stage, &second, WorkflowStatus::Failed)
                            .await?;
                        Err(second)
                    }
                }
            }
            RecoveryOutcome::Escalated => {
                self.record_failure(id, stage, &error, WorkflowStatus::Paused)
                    .await?;
                Err(error)
            }
            RecoveryOutcome::Unresolved => {
                self.record_failure(id, stage, &error, WorkflowStatus::Failed)
                    .await?;
                Err(error)
            }
        }
    }

    async fn record_failure(
        &self,
        id: WorkflowId,
        stage: Stage,
        error: &Error,
        status: WorkflowStatus,
    ) -> Result<()> {
        let mut tx = self.store.transaction(id).await?;
        {
            let state = tx.state_mut();
            state.fail_stage(stage, &error.to_string());
            let any_blocked = state
                .tasks
                .values()
                .any(|s| matches!(s, TaskStatus::Blocked { .. }));
            state.status = if status == WorkflowStatus::Failed && any_blocked {
                WorkflowStatus::Blocked
            } else {
                status
            };
        }
        tx.commit()?;

        let _ = self
            .reporter
            .failure(id, &format!("stage {} failed: {}", stage, error))
            .await;
        Ok(())
    }

    // ========== Stage implementations ==========

    /// Fetch the latest plan checkpoint.
    fn load_plan(&self, id: WorkflowId) -> Result<Plan> {
        let checkpoint = self
            .checkpoints
            .latest(id, Some(Stage::Planning))?
            .ok_or_else(|| {
                Error::Validation(format!("workflow {} has no plan checkpoint", id.short()))
            })?;
        Ok(serde_json::from_value(checkpoint.payload)?)
    }

    fn load_implementation(&self, id: WorkflowId) -> Result<ImplementationRecord> {
        let checkpoint = self
            .checkpoints
            .latest(id, Some(Stage::Implementation))?
            .ok_or_else(|| {
                Error::Validation(format!(
                    "workflow {} has no implementation checkpoint",
                    id.short()
                ))
            })?;
        Ok(serde_json::from_value(checkpoint.payload)?)
    }

    /// Completed task branches in dependency order, deduplicated (the
    /// per-plan layout maps every task to the same branch).
    fn completed_branches(record: &ImplementationRecord) -> Vec<String> {
        let completed: HashSet<&TaskId> = record.completed.iter().collect();
        let mut seen = HashSet::new();
        let mut branches = Vec::new();
        for task_id in &record.order {
            if !completed.contains(task_id) {
                continue;
            }
            if let Some(branch) = record.branches.get(task_id) {
                if seen.insert(branch.clone()) {
                    branches.push(branch.clone());
                }
            }
        }
        branches
    }

    async fn run_planning(&self, id: WorkflowId) -> Result<serde_json::Value> {
        let state = self.store.load(id)?;
        let issue_number = state.issue.ok_or_else(|| {
            Error::Validation(format!("workflow {} has no source issue", id.short()))
        })?;

        let issue = self.host.get_issue(issue_number).await?;
        let mut plan = self.agent.generate_plan(&issue).await?;
        // Plan identity is workflow identity.
        plan.id = id;

        self.host
            .comment(
                issue_number,
                &format!("Implementation plan:\n\n{}", plan.body),
            )
            .await?;
        self.host
            .add_label(issue_number, "conductor:planned")
            .await?;

        Ok(serde_json::to_value(&plan)?)
    }

    async fn run_plan_review(&self, id: WorkflowId) -> Result<serde_json::Value> {
        let state = self.store.load(id)?;
        let plan = self.load_plan(id)?;

        if let Some(issue) = state.issue {
            self.host
                .comment(
                    issue,
                    &format!("Plan approved for implementation: {}", plan.summary),
                )
                .await?;
            self.host.add_label(issue, "conductor:plan-approved").await?;
        }

        Ok(json!({ "approved": true, "summary": plan.summary }))
    }

    async fn run_implementation(&self, id: WorkflowId) -> Result<serde_json::Value> {
        let state = self.store.load(id)?;
        let plan = self.load_plan(id)?;

        // Decompose and validate before anything executes.
        let mut tracker = TaskTracker::new();
        for task in self.agent.generate_prompts(&plan).await? {
            tracker.add_task(task)?;
        }
        tracker.validate()?;
        clog_debug!(
            "workflow {} decomposed into {} tasks",
            id.short(),
            tracker.task_count()
        );

        let strategy = strategy_for(state.branching);
        let task_list: Vec<Task> = tracker.all_tasks().into_iter().cloned().collect();
        let mut branches: BTreeMap<TaskId, String> = BTreeMap::new();
        for task in &task_list {
            let branch = strategy
                .create_task_branch(self.host.as_ref(), &state, task)
                .await?;
            if let Some(tracked) = tracker.get_task_mut(&task.id) {
                tracked.set_branch(&branch);
            }
            branches.insert(task.id, branch);
        }

        // One shared branch means commits must land sequentially.
        let max_workers = match state.branching {
            BranchingMode::PerPlan => 1,
            BranchingMode::PerAgent => self.config.max_workers,
        };
        let timeout = self.config.task_timeout();

        let exec_tasks: Vec<ExecutionTask> = task_list
            .iter()
            .map(|task| {
                let agent = Arc::clone(&self.agent);
                let mut work_task = task.clone();
                work_task.branch = branches.get(&task.id).cloned();
                let context = plan.body.clone();
                ExecutionTask::new(task.id.to_string(), move || async move {
                    let result = agent.execute_task(&work_task, &context).await?;
                    Ok(serde_json::to_value(result)?)
                })
                .with_dependencies(task.depends_on.iter().map(|d| d.to_string()).collect())
                .with_timeout(timeout)
            })
            .collect();

        let outcomes = ParallelExecutor::new(max_workers).execute(exec_tasks).await?;

        // Record per-task results; a failure blocks its dependents but
        // the batch itself has already run to completion.
        let mut failed: Vec<TaskId> = Vec::new();
        for (id_str, outcome) in &outcomes {
            let task_id: TaskId = id_str
                .parse()
                .map_err(|_| Error::Validation(format!("unparseable task id: {}", id_str)))?;
            match outcome {
                TaskOutcome::Completed(value) => {
                    tracker.mark_completed(&task_id, Some(value.clone()))?;
                }
                TaskOutcome::Failed(message) => {
                    failed.push(task_id);
                    tracker.mark_failed(&task_id, message)?;
                }
                TaskOutcome::TimedOut(limit) => {
                    failed.push(task_id);
                    tracker.mark_failed(&task_id, &format!("timed out after {:?}", limit))?;
                }
                TaskOutcome::Skipped { .. } => {
                    // The tracker blocks these when the failed
                    // dependency is marked.
                }
            }
        }

        let statuses = tracker.statuses();
        {
            let mut tx = self.store.transaction(id).await?;
            tx.state_mut().tasks = statuses.clone();
            tx.commit()?;
        }

        if !failed.is_empty() {
            failed.sort();
            return Err(Error::TaskExecution {
                task: failed
                    .iter()
                    .map(|t| t.short())
                    .collect::<Vec<_>>()
                    .join(", "),
                message: format!(
                    "{} of {} tasks failed; dependents blocked",
                    failed.len(),
                    statuses.len()
                ),
            });
        }

        let order = tracker.dependency_order()?;
        let record = ImplementationRecord {
            completed: order
                .iter()
                .filter(|t| matches!(statuses.get(*t), Some(TaskStatus::Completed)))
                .copied()
                .collect(),
            order,
            branches,
            failed,
        };
        Ok(serde_json::to_value(record)?)
    }

    async fn run_code_review(&self, id: WorkflowId) -> Result<serde_json::Value> {
        let state = self.store.load(id)?;
        let record = self.load_implementation(id)?;
        let base = state
            .metadata
            .get("base_branch")
            .cloned()
            .unwrap_or_else(|| self.config.base_branch.clone());

        let mut combined = String::new();
        for branch in Self::completed_branches(&record) {
            let diff = self.host.branch_diff(&base, &branch).await?;
            combined.push_str(&diff);
            combined.push('\n');
        }

        let review = self
            .agent
            .review_code(
                &combined,
                &format!("Combined changes for workflow {}", id.short()),
            )
            .await?;

        if !review.approved {
            return Err(Error::TestsFailed {
                workflow: id,
                stage: Stage::CodeReview,
                output: review.feedback,
            });
        }

        Ok(json!({ "approved": true, "feedback": review.feedback }))
    }

    async fn run_merge(&self, id: WorkflowId) -> Result<serde_json::Value> {
        let state = self.store.load(id)?;
        let record = self.load_implementation(id)?;
        let plan = self.load_plan(id)?;
        let strategy: Box<dyn BranchingStrategy> = strategy_for(state.branching);

        let branches = Self::completed_branches(&record);
        let commit = strategy
            .integrate(
                self.host.as_ref(),
                self.recovery.as_ref(),
                &state,
                &branches,
            )
            .await?;

        let base = state
            .metadata
            .get("base_branch")
            .cloned()
            .unwrap_or_else(|| self.config.base_branch.clone());
        let head = strategy.delivery_branch(&state);
        let pr = self
            .host
            .create_pull_request(
                &plan.summary,
                &format!("Automated implementation of plan {}\n\n{}", id.short(), plan.body),
                &base,
                &head,
            )
            .await?;

        clog!(
            "workflow {} opened pull request #{} from {}",
            id.short(),
            pr,
            head
        );
        Ok(json!({ "pull_request": pr, "integration_commit": commit, "head": head }))
    }

    /// Read-only access to a workflow's persisted state.
    pub fn workflow_state(&self, id: WorkflowId) -> Result<WorkflowState> {
        self.store.load(id)
    }

    /// Explicitly prune checkpoints older than the configured
    /// retention. A no-op when no retention is configured; nothing
    /// else ever deletes checkpoints.
    pub fn cleanup_checkpoints(&self, id: WorkflowId) -> Result<usize> {
        let Some(days) = self.config.checkpoint_max_age_days else {
            return Ok(0);
        };
        let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(days));
        self.checkpoints.cleanup(id, cutoff)
    }
}
