//! Sessions and per-stage results.
//!
//! A session is one execution of the pipeline for a project. Sessions are
//! append-only; resuming creates a new session that references its parent
//! and carries the set of stages treated as already done.

use crate::model::PipelineMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

/// Stage outcome within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Failed,
    Skipped,
    PendingApproval,
}

/// Outcome of one agent stage. Append-only within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: String,
    pub role: String,
    pub status: StageStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageRecord {
    pub fn started(stage: &str, role: &str) -> Self {
        Self {
            stage: stage.to_string(),
            role: role.to_string(),
            status: StageStatus::PendingApproval,
            started_at: Utc::now(),
            ended_at: None,
            artifacts: Vec::new(),
            output: String::new(),
            error: None,
        }
    }

    pub fn finish(&mut self, status: StageStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }
}

/// One execution of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub project_id: String,
    pub mode: PipelineMode,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub stages: Vec<StageRecord>,
    /// Stages treated as already done (resume), post artifact validation.
    #[serde(default)]
    pub pre_completed: BTreeSet<String>,
}

impl Session {
    pub fn new(project_id: &str, mode: PipelineMode) -> Self {
        Self {
            id: format!("sess-{}", uuid::Uuid::new_v4().simple()),
            parent_id: None,
            project_id: project_id.to_string(),
            mode,
            status: SessionStatus::Running,
            started_at: Utc::now(),
            stages: Vec::new(),
            pre_completed: BTreeSet::new(),
        }
    }

    /// A fresh session continuing a prior one.
    pub fn resumed_from(parent: &Session) -> Self {
        let mut session = Self::new(&parent.project_id, parent.mode);
        session.parent_id = Some(parent.id.clone());
        session.pre_completed = parent.completed_stage_names();
        session
    }

    /// Stage names that reached `completed` in this session.
    pub fn completed_stage_names(&self) -> BTreeSet<String> {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Completed)
            .map(|s| s.stage.clone())
            .collect()
    }

    /// Whether a stage counts as done for dependency purposes.
    pub fn stage_done(&self, stage: &str) -> bool {
        self.pre_completed.contains(stage)
            || self
                .stages
                .iter()
                .any(|s| s.stage == stage && matches!(s.status, StageStatus::Completed | StageStatus::Skipped))
    }

    /// Append a stage record. Records are never rewritten; a re-run stage
    /// gets a second record.
    pub fn record(&mut self, record: StageRecord) {
        self.stages.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_is_running_and_unparented() {
        let session = Session::new("p1", PipelineMode::Greenfield);
        assert!(session.id.starts_with("sess-"));
        assert_eq!(session.status, SessionStatus::Running);
        assert!(session.parent_id.is_none());
        assert!(session.pre_completed.is_empty());
    }

    #[test]
    fn resumed_session_references_parent_and_inherits_progress() {
        let mut parent = Session::new("p1", PipelineMode::Greenfield);
        let mut done = StageRecord::started("collection", "collector");
        done.finish(StageStatus::Completed);
        parent.record(done);
        let mut failed = StageRecord::started("prd_generation", "prd-writer");
        failed.finish(StageStatus::Failed);
        parent.record(failed);

        let resumed = Session::resumed_from(&parent);
        assert_eq!(resumed.parent_id.as_deref(), Some(parent.id.as_str()));
        assert!(resumed.pre_completed.contains("collection"));
        assert!(!resumed.pre_completed.contains("prd_generation"));
        // A resumed session is a new entity.
        assert_ne!(resumed.id, parent.id);
    }

    #[test]
    fn stage_done_covers_pre_completed_and_skipped() {
        let mut session = Session::new("p1", PipelineMode::Enhancement);
        session.pre_completed.insert("initialization".into());

        let mut skipped = StageRecord::started("prd_update", "prd-writer");
        skipped.finish(StageStatus::Skipped);
        session.record(skipped);

        assert!(session.stage_done("initialization"));
        assert!(session.stage_done("prd_update"));
        assert!(!session.stage_done("srs_update"));
    }

    #[test]
    fn rerun_appends_a_second_record() {
        let mut session = Session::new("p1", PipelineMode::Greenfield);
        let mut first = StageRecord::started("prd_generation", "prd-writer");
        first.finish(StageStatus::Failed);
        session.record(first);
        let mut second = StageRecord::started("prd_generation", "prd-writer");
        second.finish(StageStatus::Completed);
        session.record(second);

        assert_eq!(session.stages.len(), 2);
        assert!(session.stage_done("prd_generation"));
    }
}
