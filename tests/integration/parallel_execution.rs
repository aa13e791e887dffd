//! Implementation-stage scheduling correctness.

use conductor::branching::BranchingMode;
use conductor::core::task::TaskStatus;
use conductor::workflow::{Stage, WorkflowStatus};
use conductor::Error;

use crate::fixtures::Harness;

/// The default decomposition is a chain: task-1, task-2 (dep task-1),
/// task-3 (deps task-1, task-2). Execution must respect it.
#[tokio::test]
async fn test_implementation_executes_in_dependency_order() {
    let harness = Harness::new(BranchingMode::PerAgent);
    let id = harness.create_workflow().await;

    harness.run_through(id, Stage::Implementation).await;

    let executed = harness.agent.executed.lock().unwrap().clone();
    assert_eq!(executed, vec!["task-1", "task-2", "task-3"]);

    let state = harness.store.load(id).unwrap();
    assert_eq!(state.tasks.len(), 3);
    assert!(state
        .tasks
        .values()
        .all(|s| matches!(s, TaskStatus::Completed)));
}

/// Independent tasks run concurrently, dependent tasks wait.
#[tokio::test]
async fn test_independent_tasks_complete_under_bounded_concurrency() {
    let harness = Harness::new(BranchingMode::PerAgent);
    let id = harness.create_workflow().await;
    harness.agent.script_prompts(vec![
        ("alpha", vec![]),
        ("beta", vec![]),
        ("gamma", vec![]),
        ("delta", vec!["alpha", "beta", "gamma"]),
    ]);

    harness.run_through(id, Stage::Implementation).await;

    let executed = harness.agent.executed.lock().unwrap().clone();
    assert_eq!(executed.len(), 4);
    // The dependent task always runs last.
    assert_eq!(executed[3], "delta");
}

/// A failing task fails the stage, blocks its dependents (which never
/// run), and leaves completed siblings completed.
#[tokio::test]
async fn test_failed_task_blocks_dependents_and_fails_stage() {
    let harness = Harness::new(BranchingMode::PerAgent);
    let id = harness.create_workflow().await;
    harness.agent.fail_task("task-2");

    harness.run_through(id, Stage::PlanReview).await;
    let err = harness
        .orchestrator
        .process(id, Stage::Implementation)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::TaskExecution { .. }));

    // task-3 never executed.
    let executed = harness.agent.executed.lock().unwrap().clone();
    assert_eq!(executed, vec!["task-1", "task-2"]);

    // Statuses: completed, failed, blocked - nothing dropped.
    let state = harness.store.load(id).unwrap();
    let mut statuses: Vec<String> = state.tasks.values().map(|s| s.to_string()).collect();
    statuses.sort();
    assert_eq!(statuses.len(), 3);
    assert!(statuses.iter().any(|s| s == "completed"));
    assert!(statuses.iter().any(|s| s.starts_with("failed")));
    assert!(statuses.iter().any(|s| s.starts_with("blocked")));
}

/// An escalated implementation failure surfaces the blocked tasks in
/// the workflow status once recovery declines.
#[tokio::test]
async fn test_unrecovered_task_failure_pauses_workflow() {
    let harness = Harness::new(BranchingMode::PerAgent);
    let id = harness.create_workflow().await;
    harness.agent.fail_task("task-1");

    harness.run_through(id, Stage::PlanReview).await;
    assert!(harness
        .orchestrator
        .process(id, Stage::Implementation)
        .await
        .is_err());

    // Task execution errors have no specialized strategy; manual
    // intervention pauses the workflow.
    let attempts = harness.recovery.attempts(id).unwrap();
    assert_eq!(attempts.last().unwrap().strategy, "manual_intervention");
    assert_eq!(
        harness.store.load(id).unwrap().status,
        WorkflowStatus::Paused
    );
}

/// A cyclic decomposition is rejected at validation, before any task
/// or branch is created.
#[tokio::test]
async fn test_cyclic_decomposition_fails_validation_before_execution() {
    let harness = Harness::new(BranchingMode::PerAgent);
    let id = harness.create_workflow().await;
    harness
        .agent
        .script_prompts(vec![("ouro", vec!["boros"]), ("boros", vec!["ouro"])]);

    harness.run_through(id, Stage::PlanReview).await;
    let err = harness
        .orchestrator
        .process(id, Stage::Implementation)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Graph(_)));

    // Validation failed before anything executed or any branch was cut.
    assert!(harness.agent.executed.lock().unwrap().is_empty());
    assert!(!harness
        .host
        .branches
        .lock()
        .unwrap()
        .iter()
        .any(|b| b.starts_with("task/")));
}

/// Per-plan workflows execute tasks strictly sequentially on the
/// shared branch.
#[tokio::test]
async fn test_per_plan_tasks_commit_sequentially() {
    let harness = Harness::new(BranchingMode::PerPlan);
    let id = harness.create_workflow().await;
    harness.agent.script_prompts(vec![
        ("first", vec![]),
        ("second", vec![]),
        ("third", vec![]),
    ]);

    harness.run_through(id, Stage::Implementation).await;

    // All three ran (sequentially, on one branch); with independent
    // tasks and one worker the launch order is the id tie-break, so we
    // only assert completeness and the single shared branch.
    let executed = harness.agent.executed.lock().unwrap().clone();
    assert_eq!(executed.len(), 3);

    let branches = harness.host.branches.lock().unwrap();
    let plan_branch = format!("plan/{}", id.short());
    assert!(branches.contains(&plan_branch));
    assert!(!branches.iter().any(|b| b.starts_with("task/")));
}
