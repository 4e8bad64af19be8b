//! Canonical scratchpad layout.
//!
//! Every section maps to a fixed relative path under the scratchpad root.
//! The path map is part of the public contract: agents and resumed sessions
//! address state by these exact paths, so changing one is a breaking change.
//!
//! ```text
//! .ad-sdlc/
//!   config/{workflow.yaml, agents.yaml}
//!   scratchpad/
//!     info/{projectId}/collected_info.yaml
//!     info/{projectId}/project.yaml
//!     documents/{projectId}/{prd,srs,sds}.md
//!     issues/{projectId}/{issue_list.json, dependency_graph.json}
//!     progress/{projectId}/controller_state.yaml
//!     progress/{projectId}/work_orders/WO-NNN.yaml
//!     progress/{projectId}/results/WO-NNN-result.yaml
//!     progress/{projectId}/reviews/PR-NNN-review.yaml
//!     progress/{projectId}/transitions.yaml
//!     checkpoints/{workOrderId}.yaml
//!     history/{section}/{entry-N}.yaml
//!   sessions/{sessionId}.yaml
//!   logs/...
//! ```

use std::path::PathBuf;

/// The name of the project configuration directory.
pub const CONFIG_DIR: &str = ".ad-sdlc";

/// On-disk serialization format of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
    Markdown,
}

/// A named slot in the scratchpad.
///
/// Variants carrying a `String` are keyed by an entity id (`WO-NNN`,
/// `PR-NNN`, session id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Section {
    Project,
    CollectedInfo,
    Prd,
    Srs,
    Sds,
    IssueList,
    DependencyGraph,
    ControllerState,
    Transitions,
    WorkOrder(String),
    ImplementationResult(String),
    Review(String),
    Checkpoint(String),
    Session(String),
}

impl Section {
    /// Path relative to the `.ad-sdlc` root.
    pub fn relative_path(&self, project_id: &str) -> PathBuf {
        let p = match self {
            Self::Project => format!("scratchpad/info/{project_id}/project.yaml"),
            Self::CollectedInfo => format!("scratchpad/info/{project_id}/collected_info.yaml"),
            Self::Prd => format!("scratchpad/documents/{project_id}/prd.md"),
            Self::Srs => format!("scratchpad/documents/{project_id}/srs.md"),
            Self::Sds => format!("scratchpad/documents/{project_id}/sds.md"),
            Self::IssueList => format!("scratchpad/issues/{project_id}/issue_list.json"),
            Self::DependencyGraph => {
                format!("scratchpad/issues/{project_id}/dependency_graph.json")
            }
            Self::ControllerState => {
                format!("scratchpad/progress/{project_id}/controller_state.yaml")
            }
            Self::Transitions => format!("scratchpad/progress/{project_id}/transitions.yaml"),
            Self::WorkOrder(id) => {
                format!("scratchpad/progress/{project_id}/work_orders/{id}.yaml")
            }
            Self::ImplementationResult(id) => {
                format!("scratchpad/progress/{project_id}/results/{id}-result.yaml")
            }
            Self::Review(id) => {
                format!("scratchpad/progress/{project_id}/reviews/{id}-review.yaml")
            }
            Self::Checkpoint(work_order_id) => {
                format!("scratchpad/checkpoints/{work_order_id}.yaml")
            }
            Self::Session(session_id) => format!("sessions/{session_id}.yaml"),
        };
        PathBuf::from(p)
    }

    /// Serialization format for this section.
    pub fn format(&self) -> Format {
        match self {
            Self::Prd | Self::Srs | Self::Sds => Format::Markdown,
            Self::IssueList | Self::DependencyGraph => Format::Json,
            _ => Format::Yaml,
        }
    }

    /// Stable key used for the history directory and log fields.
    pub fn key(&self) -> String {
        match self {
            Self::Project => "project".into(),
            Self::CollectedInfo => "collected_info".into(),
            Self::Prd => "prd".into(),
            Self::Srs => "srs".into(),
            Self::Sds => "sds".into(),
            Self::IssueList => "issue_list".into(),
            Self::DependencyGraph => "dependency_graph".into(),
            Self::ControllerState => "controller_state".into(),
            Self::Transitions => "transitions".into(),
            Self::WorkOrder(id) => format!("work_orders-{id}"),
            Self::ImplementationResult(id) => format!("results-{id}"),
            Self::Review(id) => format!("reviews-{id}"),
            Self::Checkpoint(id) => format!("checkpoints-{id}"),
            Self::Session(id) => format!("sessions-{id}"),
        }
    }

    /// Whether writes to this section are recorded in history.
    ///
    /// High-churn bookkeeping sections (controller state, checkpoints,
    /// transition log) are excluded; documents and dispatch records are kept.
    pub fn history_enabled(&self) -> bool {
        !matches!(
            self,
            Self::ControllerState | Self::Transitions | Self::Checkpoint(_) | Self::Session(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_the_published_layout() {
        let cases = [
            (
                Section::CollectedInfo,
                "scratchpad/info/proj-1/collected_info.yaml",
            ),
            (Section::Prd, "scratchpad/documents/proj-1/prd.md"),
            (
                Section::IssueList,
                "scratchpad/issues/proj-1/issue_list.json",
            ),
            (
                Section::DependencyGraph,
                "scratchpad/issues/proj-1/dependency_graph.json",
            ),
            (
                Section::WorkOrder("WO-003".into()),
                "scratchpad/progress/proj-1/work_orders/WO-003.yaml",
            ),
            (
                Section::ImplementationResult("WO-003".into()),
                "scratchpad/progress/proj-1/results/WO-003-result.yaml",
            ),
            (
                Section::Review("PR-001".into()),
                "scratchpad/progress/proj-1/reviews/PR-001-review.yaml",
            ),
            (
                Section::Checkpoint("WO-003".into()),
                "scratchpad/checkpoints/WO-003.yaml",
            ),
            (
                Section::ControllerState,
                "scratchpad/progress/proj-1/controller_state.yaml",
            ),
        ];
        for (section, expected) in cases {
            assert_eq!(section.relative_path("proj-1"), PathBuf::from(expected));
        }
    }

    #[test]
    fn formats_match_extension() {
        assert_eq!(Section::Prd.format(), Format::Markdown);
        assert_eq!(Section::IssueList.format(), Format::Json);
        assert_eq!(Section::Project.format(), Format::Yaml);
    }

    #[test]
    fn bookkeeping_sections_skip_history() {
        assert!(!Section::ControllerState.history_enabled());
        assert!(!Section::Transitions.history_enabled());
        assert!(Section::Prd.history_enabled());
        assert!(Section::WorkOrder("WO-001".into()).history_enabled());
    }
}
