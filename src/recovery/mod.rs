//! Failure recovery: strategy selection and the audit trail.
//!
//! Recovery is strategy selection, not one algorithm. Strategies are
//! tried in fixed priority order (retry, conflict resolution, test
//! fix, manual intervention); the first one whose `can_handle` accepts
//! the error runs exactly once per failure. Every attempt - resolved,
//! unresolved, or escalated - is appended to a per-workflow audit log
//! that is never deleted automatically.

pub mod strategies;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collab::{CodeHost, CodingAgent, StatusReporter};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::state::CheckpointStore;
use crate::workflow::{Stage, WorkflowId};
use crate::{clog, clog_warn};

pub use strategies::{
    ConflictResolutionStrategy, ManualInterventionStrategy, RetryStrategy, TestFixStrategy,
};

/// How a recovery attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// The strategy resolved the failure; the stage may be re-run.
    Resolved,
    /// The strategy ran but could not resolve the failure.
    Unresolved,
    /// The failure was handed to a human; the workflow pauses.
    Escalated,
}

/// One audit record. Never auto-deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub workflow: WorkflowId,
    pub stage: Stage,
    pub strategy: String,
    pub outcome: RecoveryOutcome,
    pub cause: String,
    pub created_at: DateTime<Utc>,
}

/// One remediation approach.
///
/// `can_handle` must be cheap and side-effect free; `recover` runs at
/// most once per failure and returns whether the failure was resolved.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_handle(&self, error: &Error) -> bool;

    async fn recover(&self, workflow: WorkflowId, error: &Error) -> Result<bool>;

    /// Whether an unresolved outcome from this strategy means the
    /// failure was escalated to a human rather than merely unhandled.
    fn escalates(&self) -> bool {
        false
    }
}

/// Selects and runs recovery strategies, keeping the audit trail.
pub struct RecoveryCoordinator {
    strategies: Vec<Arc<dyn RecoveryStrategy>>,
    audit_root: PathBuf,
}

impl RecoveryCoordinator {
    /// Build a coordinator over an explicit, ordered strategy list.
    pub fn new(strategies: Vec<Arc<dyn RecoveryStrategy>>, audit_root: &Path) -> Result<Self> {
        fs::create_dir_all(audit_root)?;
        Ok(Self {
            strategies,
            audit_root: audit_root.to_path_buf(),
        })
    }

    /// The standard strategy stack in priority order: retry, conflict
    /// resolution, test fix, manual intervention.
    pub fn with_default_strategies(
        checkpoints: Arc<CheckpointStore>,
        host: Arc<dyn CodeHost>,
        agent: Arc<dyn CodingAgent>,
        reporter: Arc<dyn StatusReporter>,
        config: &Config,
        audit_root: &Path,
    ) -> Result<Self> {
        let strategies: Vec<Arc<dyn RecoveryStrategy>> = vec![
            Arc::new(RetryStrategy::new(
                checkpoints,
                config.retry_max_attempts,
                config.retry_base_delay(),
            )),
            Arc::new(ConflictResolutionStrategy::new(
                Arc::clone(&agent),
                Arc::clone(&host),
            )),
            Arc::new(TestFixStrategy::new(agent)),
            Arc::new(ManualInterventionStrategy::new(reporter)),
        ];
        Self::new(strategies, audit_root)
    }

    /// The fixed priority order the strategies are consulted in.
    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    fn audit_path(&self, id: WorkflowId) -> PathBuf {
        self.audit_root.join(format!("{}.recovery.jsonl", id))
    }

    /// Classify `error` and run the first matching strategy once.
    ///
    /// The attempt is recorded in the audit trail regardless of
    /// outcome. A strategy whose own execution errors is treated as
    /// unresolved.
    pub async fn handle(
        &self,
        workflow: WorkflowId,
        stage: Stage,
        error: &Error,
    ) -> Result<RecoveryOutcome> {
        for strategy in &self.strategies {
            if !strategy.can_handle(error) {
                continue;
            }

            clog!(
                "recovery: workflow={} stage={} strategy={} cause={}",
                workflow.short(),
                stage,
                strategy.name(),
                error.kind()
            );

            let outcome = match strategy.recover(workflow, error).await {
                Ok(true) => RecoveryOutcome::Resolved,
                Ok(false) if strategy.escalates() => RecoveryOutcome::Escalated,
                Ok(false) => RecoveryOutcome::Unresolved,
                Err(inner) => {
                    clog_warn!(
                        "recovery strategy {} failed for workflow {}: {}",
                        strategy.name(),
                        workflow.short(),
                        inner
                    );
                    RecoveryOutcome::Unresolved
                }
            };

            self.record(RecoveryAttempt {
                workflow,
                stage,
                strategy: strategy.name().to_string(),
                outcome,
                cause: error.to_string(),
                created_at: Utc::now(),
            })?;

            return Ok(outcome);
        }

        Ok(RecoveryOutcome::Unresolved)
    }

    fn record(&self, attempt: RecoveryAttempt) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.audit_path(attempt.workflow))?;
        writeln!(file, "{}", serde_json::to_string(&attempt)?)?;
        Ok(())
    }

    /// The full audit trail for one workflow, oldest first.
    pub fn attempts(&self, workflow: WorkflowId) -> Result<Vec<RecoveryAttempt>> {
        let path = self.audit_path(workflow);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut attempts = Vec::new();
        for line in fs::read_to_string(&path)?.lines() {
            if line.trim().is_empty() {
                continue;
            }
            attempts.push(serde_json::from_str(line)?);
        }
        Ok(attempts)
    }
}
