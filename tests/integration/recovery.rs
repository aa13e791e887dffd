//! Recovery strategy selection and escalation tests.

use conductor::branching::BranchingMode;
use conductor::collab::{HostError, Review};
use conductor::recovery::RecoveryOutcome;
use conductor::workflow::{Stage, WorkflowStatus};

use crate::fixtures::Harness;

fn network_failures(n: usize) -> Vec<HostError> {
    (0..n)
        .map(|_| HostError::Network("connection reset".to_string()))
        .collect()
}

/// A transient network error selects the retry strategy, not manual
/// intervention, and the stage succeeds on the re-run.
#[tokio::test]
async fn test_transient_error_selects_retry_before_manual() {
    let harness = Harness::new(BranchingMode::PerAgent);
    let id = harness.create_workflow().await;
    harness.host.fail_get_issue(network_failures(1));

    harness
        .orchestrator
        .process(id, Stage::Planning)
        .await
        .expect("retry should recover the stage");

    let attempts = harness.recovery.attempts(id).unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].strategy, "retry");
    assert_eq!(attempts[0].outcome, RecoveryOutcome::Resolved);
    assert!(attempts[0].cause.contains("network"));

    let state = harness.store.load(id).unwrap();
    assert!(state.stage_completed(Stage::Planning));
    assert_eq!(state.status, WorkflowStatus::Pending);
}

/// Once the retry budget for a failure signature is spent, the next
/// identical failure falls through to manual intervention and the
/// workflow pauses.
#[tokio::test]
async fn test_retry_budget_exhaustion_escalates_to_manual() {
    let harness = Harness::new(BranchingMode::PerAgent);
    let id = harness.create_workflow().await;
    // Enough identical failures that every attempt (including the
    // post-recovery re-runs) keeps failing.
    harness.host.fail_get_issue(network_failures(10));

    // Attempt 1: fails, retry resolves, re-run fails -> stage failed.
    assert!(harness.orchestrator.process(id, Stage::Planning).await.is_err());
    // Attempt 2: same, spending the rest of the retry budget.
    assert!(harness.orchestrator.process(id, Stage::Planning).await.is_err());
    // Attempt 3: retry declines the signature; manual intervention.
    assert!(harness.orchestrator.process(id, Stage::Planning).await.is_err());

    let attempts = harness.recovery.attempts(id).unwrap();
    let strategies: Vec<&str> = attempts.iter().map(|a| a.strategy.as_str()).collect();
    assert_eq!(strategies, vec!["retry", "retry", "manual_intervention"]);
    assert_eq!(attempts[2].outcome, RecoveryOutcome::Escalated);

    // Escalation pauses the workflow and notifies a human.
    let state = harness.store.load(id).unwrap();
    assert_eq!(state.status, WorkflowStatus::Paused);
    let notices = harness.reporter.failure_notices.lock().unwrap();
    assert!(notices
        .iter()
        .any(|(wid, msg)| *wid == id && msg.contains("manual intervention required")));
}

/// An error no specialized strategy matches always lands on manual
/// intervention.
#[tokio::test]
async fn test_unmatched_error_always_hits_manual_intervention() {
    let harness = Harness::new(BranchingMode::PerAgent);
    let id = harness.create_workflow().await;
    harness
        .host
        .fail_get_issue(vec![HostError::Auth("token expired".to_string())]);

    let err = harness
        .orchestrator
        .process(id, Stage::Planning)
        .await
        .unwrap_err();
    assert!(matches!(err, conductor::Error::Host(HostError::Auth(_))));

    let attempts = harness.recovery.attempts(id).unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].strategy, "manual_intervention");
    assert_eq!(attempts[0].outcome, RecoveryOutcome::Escalated);

    assert_eq!(
        harness.store.load(id).unwrap().status,
        WorkflowStatus::Paused
    );
}

/// A rejected review selects the test-fix strategy, which re-invokes
/// implementation with the failure output, and the stage passes on the
/// re-run.
#[tokio::test]
async fn test_rejected_review_selects_test_fix() {
    let harness = Harness::new(BranchingMode::PerAgent);
    let id = harness.create_workflow().await;
    harness.agent.script_review(Review {
        approved: false,
        feedback: "2 assertions failed in widget_test".to_string(),
    });

    harness.run_through(id, Stage::CodeReview).await;

    let attempts = harness.recovery.attempts(id).unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].strategy, "test_fix");
    assert_eq!(attempts[0].outcome, RecoveryOutcome::Resolved);
    assert!(attempts[0].cause.contains("review failed"));

    // The fix pass re-invoked the agent with the failure context.
    let executed = harness.agent.executed.lock().unwrap();
    assert!(executed.contains(&"address-review-findings".to_string()));

    let state = harness.store.load(id).unwrap();
    assert!(state.stage_completed(Stage::CodeReview));
}

/// A paused (escalated) workflow is skipped by `process_all` until it
/// is relabeled externally.
#[tokio::test]
async fn test_paused_workflow_waits_for_external_action() {
    let harness = Harness::new(BranchingMode::PerAgent);
    let id = harness.create_workflow().await;
    harness
        .host
        .fail_get_issue(vec![HostError::Auth("revoked".to_string())]);

    assert!(harness.orchestrator.process(id, Stage::Planning).await.is_err());
    assert_eq!(
        harness.store.load(id).unwrap().status,
        WorkflowStatus::Paused
    );

    let summary = harness.orchestrator.process_all(None).await.unwrap();
    assert!(summary.skipped.contains(&id));
    assert!(summary.succeeded.is_empty());

    // External action: relabel the workflow back to pending.
    {
        let mut tx = harness.store.transaction(id).await.unwrap();
        tx.state_mut().status = WorkflowStatus::Pending;
        tx.commit().unwrap();
    }

    let summary = harness.orchestrator.process_all(None).await.unwrap();
    assert_eq!(summary.succeeded, vec![id]);
}

/// Every recovery attempt, resolved or escalated, is auditable.
#[tokio::test]
async fn test_audit_trail_records_every_attempt() {
    let harness = Harness::new(BranchingMode::PerAgent);
    let id = harness.create_workflow().await;
    harness.host.fail_get_issue(network_failures(1));

    harness
        .orchestrator
        .process(id, Stage::Planning)
        .await
        .unwrap();

    let attempts = harness.recovery.attempts(id).unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].workflow, id);
    assert_eq!(attempts[0].stage, Stage::Planning);
    assert_eq!(attempts[0].outcome, RecoveryOutcome::Resolved);
}
