//! The authoritative per-workflow state record.
//!
//! `WorkflowState` is owned exclusively by the state store; the
//! orchestrator never holds a copy outside an open transaction. Stage
//! transitions are validated against the static table in
//! [`Stage::successor`] - an out-of-order request fails without
//! mutating anything.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::branching::BranchingMode;
use crate::core::task::{TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::workflow::types::{Stage, StageStatus, WorkflowStatus};
use crate::workflow::WorkflowId;

/// Record of one stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    /// The stage that executed.
    pub stage: Stage,
    /// How the execution ended (or that it is still running).
    pub status: StageStatus,
    /// Data produced by the stage, if any.
    pub data: Option<serde_json::Value>,
    /// Error text when the stage failed.
    pub error: Option<String>,
    /// When the stage was entered.
    pub started_at: DateTime<Utc>,
    /// When the stage finished (success or failure).
    pub finished_at: Option<DateTime<Utc>>,
}

/// Durable record of one workflow's progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    /// The workflow (plan) identifier.
    pub id: WorkflowId,
    /// Source issue number on the code host.
    pub issue: Option<u64>,
    /// The stage the workflow is currently in. The stage is "entered"
    /// when execution starts; its completion is recorded in `stages`.
    stage: Stage,
    /// Lifecycle status, orthogonal to the stage.
    pub status: WorkflowStatus,
    /// Branch layout, resolved once at plan creation so later stages
    /// (possibly different processes) stay consistent.
    pub branching: BranchingMode,
    /// Per-stage execution records, in order of execution.
    pub stages: Vec<StageRecord>,
    /// Per-task status snapshot from the implementation stage.
    #[serde(default)]
    pub tasks: BTreeMap<TaskId, TaskStatus>,
    /// Labels used by `process_all` filtering.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// When the workflow was created.
    pub created_at: DateTime<Utc>,
    /// Last persisted mutation.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Create a fresh state at the start of the pipeline.
    pub fn new(id: WorkflowId) -> Self {
        let now = Utc::now();
        Self {
            id,
            issue: None,
            stage: Stage::Planning,
            status: WorkflowStatus::Pending,
            branching: BranchingMode::default(),
            stages: Vec::new(),
            tasks: BTreeMap::new(),
            labels: Vec::new(),
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The stage the workflow is currently in.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Latest record for the given stage, if it ever ran.
    pub fn stage_record(&self, stage: Stage) -> Option<&StageRecord> {
        self.stages.iter().rev().find(|r| r.stage == stage)
    }

    /// Whether the given stage has completed successfully.
    pub fn stage_completed(&self, stage: Stage) -> bool {
        self.stage_record(stage)
            .map(|r| r.status == StageStatus::Completed)
            .unwrap_or(false)
    }

    /// Check whether `target` may execute next.
    ///
    /// The current stage may be (re-)entered until it completes; once
    /// it has completed, only its immediate successor is legal.
    pub fn can_transition(&self, target: Stage) -> bool {
        if target == self.stage {
            !self.stage_completed(self.stage)
        } else {
            self.stage_completed(self.stage) && self.stage.successor() == Some(target)
        }
    }

    /// Move the workflow into `target`.
    ///
    /// Fails with `StageSequenceError` and mutates nothing when the
    /// transition is not legal.
    pub fn transition(&mut self, target: Stage) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::StageSequence {
                from: self.stage,
                to: target,
            });
        }
        self.stage = target;
        Ok(())
    }

    /// Record that `stage` has started executing.
    pub fn begin_stage(&mut self, stage: Stage) {
        self.stages.push(StageRecord {
            stage,
            status: StageStatus::InProgress,
            data: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        });
    }

    /// Record that `stage` finished successfully with its data payload.
    pub fn finish_stage(&mut self, stage: Stage, data: Option<serde_json::Value>) {
        if let Some(record) = self.stages.iter_mut().rev().find(|r| r.stage == stage) {
            record.status = StageStatus::Completed;
            record.data = data;
            record.finished_at = Some(Utc::now());
        }
    }

    /// Record that `stage` failed.
    pub fn fail_stage(&mut self, stage: Stage, error: &str) {
        if let Some(record) = self.stages.iter_mut().rev().find(|r| r.stage == stage) {
            record.status = StageStatus::Failed;
            record.error = Some(error.to_string());
            record.finished_at = Some(Utc::now());
        }
    }

    /// Whether the workflow carries the given label.
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Bump the updated-at timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
