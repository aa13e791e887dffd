//! The built-in recovery strategies, in priority order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::collab::{CodeHost, CodingAgent, ConflictInfo, StatusReporter};
use crate::core::task::Task;
use crate::error::{Error, Result};
use crate::recovery::RecoveryStrategy;
use crate::state::CheckpointStore;
use crate::workflow::WorkflowId;
use crate::{clog, clog_debug, clog_warn};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Retries transient failures (network, rate limit, timeouts) after
/// exponential backoff, resuming from the latest checkpoint.
///
/// Attempts are bounded per failure signature; once the budget is
/// spent, `can_handle` declines that signature so the next failure
/// falls through to manual intervention.
pub struct RetryStrategy {
    checkpoints: Arc<CheckpointStore>,
    max_attempts: u32,
    base_delay: Duration,
    attempts: StdMutex<HashMap<String, u32>>,
}

impl RetryStrategy {
    pub fn new(checkpoints: Arc<CheckpointStore>, max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            checkpoints,
            max_attempts,
            base_delay,
            attempts: StdMutex::new(HashMap::new()),
        }
    }

    /// Failure signature: the error kind plus its rendered text, which
    /// carries the relevant ids.
    fn signature(error: &Error) -> String {
        format!("{}:{}", error.kind(), error)
    }

    fn attempts_for(&self, signature: &str) -> u32 {
        *self
            .attempts
            .lock()
            .expect("retry attempt map poisoned")
            .get(signature)
            .unwrap_or(&0)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

#[async_trait]
impl RecoveryStrategy for RetryStrategy {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn can_handle(&self, error: &Error) -> bool {
        error.is_transient() && self.attempts_for(&Self::signature(error)) < self.max_attempts
    }

    async fn recover(&self, workflow: WorkflowId, error: &Error) -> Result<bool> {
        let signature = Self::signature(error);
        let attempt = {
            let mut attempts = self.attempts.lock().expect("retry attempt map poisoned");
            let count = attempts.entry(signature.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let delay = self.backoff(attempt);
        clog!(
            "retry {}/{} for workflow {} after {:?} ({})",
            attempt,
            self.max_attempts,
            workflow.short(),
            delay,
            error.kind()
        );
        tokio::time::sleep(delay).await;

        match self.checkpoints.latest(workflow, None)? {
            Some(checkpoint) => {
                clog_debug!(
                    "resuming workflow {} from {} checkpoint",
                    workflow.short(),
                    checkpoint.stage
                );
            }
            None => {
                clog_debug!(
                    "no checkpoint for workflow {}, re-running stage from scratch",
                    workflow.short()
                );
            }
        }

        Ok(true)
    }
}

/// Delegates merge conflicts to the coding agent and completes the
/// merge with the produced resolution.
pub struct ConflictResolutionStrategy {
    agent: Arc<dyn CodingAgent>,
    host: Arc<dyn CodeHost>,
}

impl ConflictResolutionStrategy {
    pub fn new(agent: Arc<dyn CodingAgent>, host: Arc<dyn CodeHost>) -> Self {
        Self { agent, host }
    }
}

#[async_trait]
impl RecoveryStrategy for ConflictResolutionStrategy {
    fn name(&self) -> &'static str {
        "conflict_resolution"
    }

    fn can_handle(&self, error: &Error) -> bool {
        matches!(error, Error::MergeConflict { .. })
    }

    async fn recover(&self, workflow: WorkflowId, error: &Error) -> Result<bool> {
        let Error::MergeConflict { base, head, diff } = error else {
            return Ok(false);
        };

        let info = ConflictInfo {
            base: base.clone(),
            head: head.clone(),
            diff: diff.clone(),
        };
        clog!(
            "resolving conflict for workflow {}: {} <- {}",
            workflow.short(),
            base,
            head
        );

        let resolution = self.agent.resolve_conflict(&info).await?;
        let outcome = self
            .host
            .merge_with_resolution(base, head, &resolution)
            .await
            .map_err(Error::Host)?;

        if !outcome.is_merged() {
            clog_warn!(
                "resolution for workflow {} still conflicts on {}",
                workflow.short(),
                head
            );
            return Ok(false);
        }
        Ok(true)
    }
}

/// Re-invokes implementation with the review/test failure output
/// appended to the context.
pub struct TestFixStrategy {
    agent: Arc<dyn CodingAgent>,
}

impl TestFixStrategy {
    pub fn new(agent: Arc<dyn CodingAgent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl RecoveryStrategy for TestFixStrategy {
    fn name(&self) -> &'static str {
        "test_fix"
    }

    fn can_handle(&self, error: &Error) -> bool {
        matches!(error, Error::TestsFailed { .. })
    }

    async fn recover(&self, workflow: WorkflowId, error: &Error) -> Result<bool> {
        let Error::TestsFailed { output, .. } = error else {
            return Ok(false);
        };

        let task = Task::new(
            workflow,
            "address-review-findings",
            "Fix the failures reported by review",
        );
        let context = format!(
            "The previous change did not pass review. Address every finding.\n\n{}",
            output
        );

        clog!("test-fix pass for workflow {}", workflow.short());
        let result = self.agent.execute_task(&task, &context).await?;
        clog_debug!(
            "test-fix for workflow {} produced: {}",
            workflow.short(),
            result.summary
        );
        Ok(true)
    }
}

/// Fallback for everything: records the escalation, notifies a human,
/// and leaves the workflow paused until it is relabeled externally.
pub struct ManualInterventionStrategy {
    reporter: Arc<dyn StatusReporter>,
}

impl ManualInterventionStrategy {
    pub fn new(reporter: Arc<dyn StatusReporter>) -> Self {
        Self { reporter }
    }
}

#[async_trait]
impl RecoveryStrategy for ManualInterventionStrategy {
    fn name(&self) -> &'static str {
        "manual_intervention"
    }

    fn can_handle(&self, _error: &Error) -> bool {
        true
    }

    async fn recover(&self, workflow: WorkflowId, error: &Error) -> Result<bool> {
        self.reporter
            .failure(
                workflow,
                &format!("manual intervention required: {}", error),
            )
            .await?;
        Ok(false)
    }

    fn escalates(&self) -> bool {
        true
    }
}
