//! Work orders and implementation results.
//!
//! A work order is the durable dispatch record for one issue: at most one
//! exists per issue in a non-terminal state, and every order snapshots the
//! context a worker needs so the invocation is self-contained. The
//! implementation result is written exactly once per order; in a retry
//! chain the last writer wins.

use crate::model::IssueStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Work order lifecycle. `Completed`, `Failed`, and `Blocked` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOrderStatus {
    Assigned,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl WorkOrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Blocked)
    }
}

/// Context snapshot taken at dispatch time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkOrderContext {
    /// SDS component this task implements.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_id: Option<String>,
    /// SRS feature it belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_id: Option<String>,
    /// PRD requirement it traces back to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirement_id: Option<String>,
    #[serde(default)]
    pub related_files: Vec<String>,
    /// Completion status of each dependency at dispatch time.
    #[serde(default)]
    pub dependency_status: BTreeMap<String, IssueStatus>,
}

/// Assignment of an order to a worker slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub worker_id: String,
    pub assigned_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Durable dispatch record for one issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrder {
    pub id: String,
    pub issue_id: String,
    pub priority_score: u32,
    pub created_at: DateTime<Utc>,
    pub status: WorkOrderStatus,
    #[serde(default)]
    pub context: WorkOrderContext,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignment: Option<Assignment>,
    /// How many times this issue has been re-queued after review rejection
    /// or reassignment.
    #[serde(default)]
    pub retry: u32,
}

impl WorkOrder {
    pub fn new(id: &str, issue_id: &str, priority_score: u32) -> Self {
        Self {
            id: id.to_string(),
            issue_id: issue_id.to_string(),
            priority_score,
            created_at: Utc::now(),
            status: WorkOrderStatus::Assigned,
            context: WorkOrderContext::default(),
            acceptance_criteria: Vec::new(),
            assignment: None,
            retry: 0,
        }
    }

    pub fn with_context(mut self, context: WorkOrderContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_acceptance_criteria(mut self, criteria: Vec<String>) -> Self {
        self.acceptance_criteria = criteria;
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn assign(&mut self, worker_id: &str) {
        self.assignment = Some(Assignment {
            worker_id: worker_id.to_string(),
            assigned_at: Utc::now(),
            finished_at: None,
        });
        self.status = WorkOrderStatus::InProgress;
    }

    pub fn finish(&mut self, status: WorkOrderStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        if let Some(assignment) = &mut self.assignment {
            assignment.finished_at = Some(Utc::now());
        }
    }
}

/// Kind of change a worker made to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
}

/// One file touched by an implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
    pub lines_added: usize,
    pub lines_removed: usize,
}

/// Outcome of the verification step's four checks.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub tests_passed: bool,
    pub lint_passed: bool,
    pub build_passed: bool,
    pub typecheck_passed: bool,
    pub coverage_percent: f64,
}

impl VerificationOutcome {
    pub fn all_passed(&self) -> bool {
        self.tests_passed && self.lint_passed && self.build_passed && self.typecheck_passed
    }
}

/// Output of one work order, written exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplementationResult {
    pub order_id: String,
    pub issue_id: String,
    pub branch: String,
    #[serde(default)]
    pub changes: Vec<FileChange>,
    #[serde(default)]
    pub test_artifacts: Vec<String>,
    pub verification: VerificationOutcome,
    #[serde(default)]
    pub commits: Vec<String>,
    pub retry_count: u32,
    pub final_status: WorkOrderStatus,
}
