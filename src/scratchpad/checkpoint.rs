//! Checkpoints for worker step resume.
//!
//! A checkpoint snapshots where a work order got to before a crash or
//! pause. Steps have a fixed taxonomy; resumable steps restart in place,
//! non-resumable ones (verification, commit, result persistence) restart
//! from code generation so their side effects are rebuilt rather than
//! replayed.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default checkpoint lifetime before it is considered stale.
const DEFAULT_TTL_HOURS: i64 = 24;

/// The fixed step taxonomy of a worker run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStep {
    ContextAnalysis,
    BranchCreation,
    CodeGeneration,
    TestGeneration,
    Verification,
    Commit,
    ResultPersistence,
}

impl WorkerStep {
    pub const ALL: [WorkerStep; 7] = [
        Self::ContextAnalysis,
        Self::BranchCreation,
        Self::CodeGeneration,
        Self::TestGeneration,
        Self::Verification,
        Self::Commit,
        Self::ResultPersistence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContextAnalysis => "context_analysis",
            Self::BranchCreation => "branch_creation",
            Self::CodeGeneration => "code_generation",
            Self::TestGeneration => "test_generation",
            Self::Verification => "verification",
            Self::Commit => "commit",
            Self::ResultPersistence => "result_persistence",
        }
    }

    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Self::ContextAnalysis
                | Self::BranchCreation
                | Self::CodeGeneration
                | Self::TestGeneration
        )
    }

    /// Where a resumed run picks up when this step was interrupted.
    pub fn resume_step(&self) -> WorkerStep {
        if self.is_resumable() {
            *self
        } else {
            Self::CodeGeneration
        }
    }

    /// The next step in the sequence, if any.
    pub fn next(&self) -> Option<WorkerStep> {
        let i = Self::ALL.iter().position(|s| s == self)?;
        Self::ALL.get(i + 1).copied()
    }
}

impl std::fmt::Display for WorkerStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of worker progress for one work order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub work_order_id: String,
    pub step: WorkerStep,
    pub attempt: u32,
    /// Opaque step payload restored verbatim to the caller.
    pub state: serde_yaml::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        work_order_id: &str,
        step: WorkerStep,
        attempt: u32,
        state: serde_yaml::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            work_order_id: work_order_id.to_string(),
            step,
            attempt,
            state,
            created_at: now,
            expires_at: now + Duration::hours(DEFAULT_TTL_HOURS),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// A later checkpoint for the same order strictly supersedes this one.
    pub fn superseded_by(&self, other: &Checkpoint) -> bool {
        other.work_order_id == self.work_order_id && other.created_at > self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_order_is_the_documented_sequence() {
        let names: Vec<&str> = WorkerStep::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(
            names,
            [
                "context_analysis",
                "branch_creation",
                "code_generation",
                "test_generation",
                "verification",
                "commit",
                "result_persistence"
            ]
        );
    }

    #[test]
    fn verification_and_commit_are_not_resumable() {
        assert!(!WorkerStep::Verification.is_resumable());
        assert!(!WorkerStep::Commit.is_resumable());
        assert!(!WorkerStep::ResultPersistence.is_resumable());
        assert!(WorkerStep::CodeGeneration.is_resumable());
    }

    #[test]
    fn non_resumable_steps_restart_from_code_generation() {
        assert_eq!(
            WorkerStep::Verification.resume_step(),
            WorkerStep::CodeGeneration
        );
        assert_eq!(WorkerStep::Commit.resume_step(), WorkerStep::CodeGeneration);
        // Resumable steps pick up in place.
        assert_eq!(
            WorkerStep::TestGeneration.resume_step(),
            WorkerStep::TestGeneration
        );
    }

    #[test]
    fn next_walks_the_sequence() {
        assert_eq!(
            WorkerStep::ContextAnalysis.next(),
            Some(WorkerStep::BranchCreation)
        );
        assert_eq!(WorkerStep::ResultPersistence.next(), None);
    }

    #[test]
    fn later_checkpoint_supersedes_earlier() {
        let a = Checkpoint::new("WO-001", WorkerStep::CodeGeneration, 1, serde_yaml::Value::Null);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = Checkpoint::new("WO-001", WorkerStep::TestGeneration, 1, serde_yaml::Value::Null);
        assert!(a.superseded_by(&b));
        assert!(!b.superseded_by(&a));

        let other = Checkpoint::new("WO-002", WorkerStep::Commit, 1, serde_yaml::Value::Null);
        assert!(!a.superseded_by(&other));
    }

    #[test]
    fn fresh_checkpoint_is_not_expired() {
        let cp = Checkpoint::new("WO-001", WorkerStep::CodeGeneration, 1, serde_yaml::Value::Null);
        assert!(!cp.is_expired());
    }
}
