//! Escalation reports emitted when retries are exhausted.

use crate::errors::ErrorCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One attempt in the retry chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptLog {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub category: ErrorCategory,
    pub message: String,
}

/// Terminal failure report handed to the caller's escalation sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationReport {
    pub task_id: String,
    pub worker_id: String,
    pub category: ErrorCategory,
    pub error: String,
    pub attempts: Vec<AttemptLog>,
    /// Last checkpointed progress, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<serde_yaml::Value>,
    pub recommendation: String,
    pub created_at: DateTime<Utc>,
}

impl EscalationReport {
    pub fn new(
        task_id: &str,
        worker_id: &str,
        category: ErrorCategory,
        error: &str,
        attempts: Vec<AttemptLog>,
        progress: Option<serde_yaml::Value>,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
            category,
            error: error.to_string(),
            attempts,
            progress,
            recommendation: recommendation_for(category),
            created_at: Utc::now(),
        }
    }
}

/// Canned next-step text per category, refined by operators over time.
fn recommendation_for(category: ErrorCategory) -> String {
    match category {
        ErrorCategory::Transient => {
            "External service stayed unavailable through all retries; check connectivity and rate limits, then resume the session".into()
        }
        ErrorCategory::Recoverable => {
            "Automatic fixes made no further progress; inspect the verification output and re-queue the task after a manual fix".into()
        }
        ErrorCategory::Fatal => {
            "Non-retryable failure; resolve the underlying cause (permissions, missing dependency, corrupted state) before resuming".into()
        }
        ErrorCategory::User => "Correct the request and start again".into(),
        ErrorCategory::Internal => {
            "Invariant violation; collect the crash report and file a bug before resuming".into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_carries_attempt_chain() {
        let attempts = vec![
            AttemptLog {
                attempt: 1,
                started_at: Utc::now(),
                duration_ms: 120,
                category: ErrorCategory::Transient,
                message: "connection reset".into(),
            },
            AttemptLog {
                attempt: 2,
                started_at: Utc::now(),
                duration_ms: 95,
                category: ErrorCategory::Transient,
                message: "connection reset".into(),
            },
        ];
        let report = EscalationReport::new(
            "WO-003",
            "worker-2",
            ErrorCategory::Transient,
            "connection reset",
            attempts,
            None,
        );
        assert_eq!(report.attempts.len(), 2);
        assert!(report.recommendation.contains("resume"));
    }

    #[test]
    fn recommendations_differ_by_category() {
        let fatal = recommendation_for(ErrorCategory::Fatal);
        let transient = recommendation_for(ErrorCategory::Transient);
        assert_ne!(fatal, transient);
    }
}
