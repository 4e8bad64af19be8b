//! Typed error hierarchy for the orchestration core.
//!
//! Three top-level enums cover the three subsystems:
//! - `ScratchpadError` — state-store failures (schema, locks, transitions)
//! - `AnalyzerError` — dependency-graph analysis failures
//! - `PipelineError` — orchestrator and dispatch failures
//!
//! `ErrorCategory` is the cross-cutting taxonomy the retry layer and the
//! orchestrator use to decide between retry, escalate, and abort.

use std::path::PathBuf;
use thiserror::Error;

/// Cross-cutting error taxonomy. Every failure that reaches the retry layer
/// or the orchestrator is tagged with exactly one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network, rate limit, temporary unavailability. Retried with backoff.
    Transient,
    /// Test/lint/build/type failure. Retried after a fix attempt.
    Recoverable,
    /// Missing dependency, permission denied, corrupted state, context
    /// overflow. Never retried; escalated immediately.
    Fatal,
    /// Invalid mode, malformed request, missing credentials. Surfaced to the
    /// user; never retried.
    User,
    /// Invariant violation. Aborts the session with exit code 3.
    Internal,
}

impl ErrorCategory {
    /// Whether the retry layer may attempt this category again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Recoverable)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Recoverable => "recoverable",
            Self::Fatal => "fatal",
            Self::User => "user",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Errors from the scratchpad state manager.
#[derive(Debug, Error)]
pub enum ScratchpadError {
    #[error("Section '{section}' not found for project {project_id}")]
    NotFound { section: String, project_id: String },

    #[error("Schema validation failed for section '{section}': {message}")]
    SchemaValidation { section: String, message: String },

    #[error("Schema version {found} of section '{section}' has no migration path to {current}")]
    SchemaMismatch {
        section: String,
        found: u32,
        current: u32,
    },

    #[error("Timed out after {waited_ms}ms acquiring lock on {path}")]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    #[error("Invalid transition from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },

    #[error("Cannot skip to '{target}': required stage '{required}' would be bypassed")]
    RequiredSkip { target: String, required: String },

    #[error("Corrupt state in {path}: {message}")]
    CorruptState { path: PathBuf, message: String },

    #[error("Failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed for section '{section}': {message}")]
    Serialize { section: String, message: String },
}

impl ScratchpadError {
    /// Map onto the cross-cutting taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::LockTimeout { .. } | Self::Io { .. } => ErrorCategory::Transient,
            Self::CorruptState { .. } => ErrorCategory::Fatal,
            Self::NotFound { .. }
            | Self::SchemaValidation { .. }
            | Self::SchemaMismatch { .. }
            | Self::InvalidTransition { .. }
            | Self::RequiredSkip { .. }
            | Self::Serialize { .. } => ErrorCategory::Fatal,
        }
    }
}

/// Errors from the dependency graph analyzer.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    /// The input graph contains a cycle. `cycle` is a minimum witness with
    /// the first node repeated at the end, e.g. `[A, B, C, A]`.
    #[error("Circular dependency detected: {}", cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    #[error("Edge references unknown issue '{id}'")]
    UnknownNode { id: String },

    #[error("Duplicate issue id '{id}'")]
    DuplicateNode { id: String },
}

/// Errors from the orchestrator and the worker pool.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(
        "Stage '{stage}' failed ({category}): {message}. Recommended: {recommendation}. Resume with session {session_id}"
    )]
    StageFailed {
        stage: String,
        category: ErrorCategory,
        message: String,
        recommendation: String,
        session_id: String,
    },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("Stage '{0}' is not part of this pipeline mode")]
    UnknownStage(String),

    #[error("Missing credential: {0} is not set")]
    MissingCredential(&'static str),

    #[error("Internal invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Scratchpad(#[from] ScratchpadError),

    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::StageFailed { category, .. } => *category,
            Self::BadRequest(_)
            | Self::SessionNotFound(_)
            | Self::UnknownStage(_)
            | Self::MissingCredential(_) => ErrorCategory::User,
            Self::Invariant(_) => ErrorCategory::Internal,
            Self::Scratchpad(e) => e.category(),
            Self::Analyzer(_) => ErrorCategory::Fatal,
            Self::Other(_) => ErrorCategory::Fatal,
        }
    }

    /// Process exit code per the CLI contract: 1 user error, 2 pipeline
    /// failure (session paused), 3 internal error.
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::User => 1,
            ErrorCategory::Internal => 3,
            _ => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_retryability() {
        assert!(ErrorCategory::Transient.is_retryable());
        assert!(ErrorCategory::Recoverable.is_retryable());
        assert!(!ErrorCategory::Fatal.is_retryable());
        assert!(!ErrorCategory::User.is_retryable());
        assert!(!ErrorCategory::Internal.is_retryable());
    }

    #[test]
    fn lock_timeout_is_transient() {
        let err = ScratchpadError::LockTimeout {
            path: PathBuf::from("x.yaml.lock"),
            waited_ms: 5000,
        };
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert!(err.to_string().contains("5000ms"));
    }

    #[test]
    fn corrupt_state_is_fatal() {
        let err = ScratchpadError::CorruptState {
            path: PathBuf::from("prd.md"),
            message: "unexpected EOF".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Fatal);
    }

    #[test]
    fn circular_dependency_names_cycle() {
        let err = AnalyzerError::CircularDependency {
            cycle: vec!["A".into(), "B".into(), "C".into(), "A".into()],
        };
        assert_eq!(
            err.to_string(),
            "Circular dependency detected: A -> B -> C -> A"
        );
    }

    #[test]
    fn exit_codes_follow_cli_contract() {
        assert_eq!(PipelineError::BadRequest("bad".into()).exit_code(), 1);
        assert_eq!(PipelineError::Invariant("broken".into()).exit_code(), 3);
        let failed = PipelineError::StageFailed {
            stage: "prd_generation".into(),
            category: ErrorCategory::Fatal,
            message: "agent crashed".into(),
            recommendation: "resume after fixing credentials".into(),
            session_id: "sess-1".into(),
        };
        assert_eq!(failed.exit_code(), 2);
    }

    #[test]
    fn stage_failed_names_stage_category_and_session() {
        let err = PipelineError::StageFailed {
            stage: "srs_generation".into(),
            category: ErrorCategory::Transient,
            message: "rate limited".into(),
            recommendation: "retry later".into(),
            session_id: "sess-42".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("srs_generation"));
        assert!(msg.contains("transient"));
        assert!(msg.contains("sess-42"));
    }
}
