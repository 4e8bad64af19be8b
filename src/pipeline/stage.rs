//! Stage definitions for the three pipeline modes.
//!
//! Stages are identified by stable names; each names its agent role, its
//! predecessors (data dependencies), whether its output needs human
//! approval, whether it is required for its mode, and the lifecycle state
//! the project reaches when it completes. Edges encode data dependencies:
//! a stage never runs before everything it reads exists.

use crate::model::PipelineMode;
use crate::scratchpad::ProjectState;

/// One named step of a pipeline.
#[derive(Debug, Clone, Copy)]
pub struct Stage {
    pub name: &'static str,
    pub role: &'static str,
    pub depends_on: &'static [&'static str],
    /// Output must be approved by a human before downstream stages run.
    pub approval_gate: bool,
    /// Required stages can never be skipped.
    pub required: bool,
    /// Lifecycle state the project advances to on completion.
    pub completes_to: Option<ProjectState>,
}

const GREENFIELD: &[Stage] = &[
    Stage {
        name: "initialization",
        role: "initializer",
        depends_on: &[],
        approval_gate: false,
        required: true,
        completes_to: None,
    },
    Stage {
        name: "collection",
        role: "collector",
        depends_on: &["initialization"],
        approval_gate: true,
        required: true,
        completes_to: Some(ProjectState::PrdDrafting),
    },
    Stage {
        name: "prd_generation",
        role: "prd-writer",
        depends_on: &["collection"],
        approval_gate: true,
        required: true,
        completes_to: Some(ProjectState::PrdApproved),
    },
    Stage {
        name: "srs_generation",
        role: "srs-writer",
        depends_on: &["prd_generation"],
        approval_gate: true,
        required: false,
        completes_to: Some(ProjectState::SrsApproved),
    },
    Stage {
        name: "sds_generation",
        role: "sds-writer",
        depends_on: &["srs_generation"],
        approval_gate: true,
        required: false,
        completes_to: Some(ProjectState::SdsApproved),
    },
    Stage {
        name: "github_repo_setup",
        role: "repo-admin",
        depends_on: &["sds_generation"],
        approval_gate: false,
        required: false,
        completes_to: None,
    },
    Stage {
        name: "issue_generation",
        role: "issue-writer",
        depends_on: &["sds_generation", "github_repo_setup"],
        approval_gate: true,
        required: true,
        completes_to: Some(ProjectState::IssuesCreated),
    },
    Stage {
        name: "implementation",
        role: "implementer",
        depends_on: &["issue_generation"],
        approval_gate: false,
        required: true,
        completes_to: Some(ProjectState::PrReview),
    },
    Stage {
        name: "pr_review",
        role: "pr-reviewer",
        depends_on: &["implementation"],
        approval_gate: true,
        required: true,
        completes_to: Some(ProjectState::Merged),
    },
];

const ENHANCEMENT: &[Stage] = &[
    Stage {
        name: "initialization",
        role: "initializer",
        depends_on: &[],
        approval_gate: false,
        required: true,
        completes_to: None,
    },
    Stage {
        name: "document_reading",
        role: "doc-reader",
        depends_on: &["initialization"],
        approval_gate: false,
        required: false,
        completes_to: None,
    },
    Stage {
        name: "codebase_analysis",
        role: "code-analyzer",
        depends_on: &["document_reading"],
        approval_gate: false,
        required: true,
        completes_to: None,
    },
    Stage {
        name: "code_reading",
        role: "code-reader",
        depends_on: &["codebase_analysis"],
        approval_gate: false,
        required: false,
        completes_to: None,
    },
    Stage {
        name: "impact_analysis",
        role: "impact-analyzer",
        depends_on: &["code_reading"],
        approval_gate: true,
        required: true,
        completes_to: Some(ProjectState::PrdDrafting),
    },
    Stage {
        name: "prd_update",
        role: "prd-writer",
        depends_on: &["impact_analysis"],
        approval_gate: true,
        required: false,
        completes_to: Some(ProjectState::PrdApproved),
    },
    Stage {
        name: "srs_update",
        role: "srs-writer",
        depends_on: &["impact_analysis"],
        approval_gate: true,
        required: false,
        completes_to: Some(ProjectState::SrsApproved),
    },
    Stage {
        name: "sds_update",
        role: "sds-writer",
        depends_on: &["impact_analysis"],
        approval_gate: true,
        required: false,
        completes_to: Some(ProjectState::SdsApproved),
    },
    Stage {
        name: "issue_generation",
        role: "issue-writer",
        depends_on: &["prd_update", "srs_update", "sds_update"],
        approval_gate: true,
        required: true,
        completes_to: Some(ProjectState::IssuesCreated),
    },
    Stage {
        name: "regression_testing",
        role: "regression-tester",
        depends_on: &["issue_generation"],
        approval_gate: false,
        required: false,
        completes_to: None,
    },
    Stage {
        name: "implementation",
        role: "implementer",
        depends_on: &["regression_testing"],
        approval_gate: false,
        required: true,
        completes_to: Some(ProjectState::PrReview),
    },
    Stage {
        name: "pr_review",
        role: "pr-reviewer",
        depends_on: &["implementation"],
        approval_gate: true,
        required: true,
        completes_to: Some(ProjectState::Merged),
    },
];

const IMPORT: &[Stage] = &[
    Stage {
        name: "initialization",
        role: "initializer",
        depends_on: &[],
        approval_gate: false,
        required: true,
        completes_to: None,
    },
    Stage {
        name: "issue_import",
        role: "issue-importer",
        depends_on: &["initialization"],
        approval_gate: true,
        required: true,
        completes_to: Some(ProjectState::IssuesCreated),
    },
    Stage {
        name: "implementation",
        role: "implementer",
        depends_on: &["issue_import"],
        approval_gate: false,
        required: true,
        completes_to: Some(ProjectState::PrReview),
    },
    Stage {
        name: "pr_review",
        role: "pr-reviewer",
        depends_on: &["implementation"],
        approval_gate: true,
        required: true,
        completes_to: Some(ProjectState::Merged),
    },
];

/// Stage list for a mode, already in topological order.
pub fn stages_for(mode: PipelineMode) -> &'static [Stage] {
    match mode {
        PipelineMode::Greenfield => GREENFIELD,
        PipelineMode::Enhancement => ENHANCEMENT,
        PipelineMode::Import => IMPORT,
    }
}

/// Look up a stage by name within a mode.
pub fn get_stage(mode: PipelineMode, name: &str) -> Option<&'static Stage> {
    stages_for(mode).iter().find(|s| s.name == name)
}

/// Impact scope reported by enhancement-mode impact analysis. Decides
/// which document-update stages actually run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactScope {
    /// Requirements change: every document is touched.
    #[default]
    Major,
    /// Behaviour change within existing requirements: SRS and SDS only.
    Moderate,
    /// Localized change: the design document alone.
    Minor,
}

impl ImpactScope {
    /// Whether a document-update stage runs under this scope.
    pub fn runs(&self, stage: &str) -> bool {
        match stage {
            "prd_update" => *self == Self::Major,
            "srs_update" => matches!(self, Self::Major | Self::Moderate),
            "sds_update" => true,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_lists_are_topologically_ordered() {
        for mode in [
            PipelineMode::Greenfield,
            PipelineMode::Enhancement,
            PipelineMode::Import,
        ] {
            let stages = stages_for(mode);
            for (i, stage) in stages.iter().enumerate() {
                for dep in stage.depends_on {
                    let dep_pos = stages
                        .iter()
                        .position(|s| s.name == *dep)
                        .unwrap_or_else(|| panic!("{mode}: unknown dependency {dep}"));
                    assert!(
                        dep_pos < i,
                        "{mode}: stage {} appears before its dependency {dep}",
                        stage.name
                    );
                }
            }
        }
    }

    #[test]
    fn every_mode_ends_in_pr_review() {
        for mode in [
            PipelineMode::Greenfield,
            PipelineMode::Enhancement,
            PipelineMode::Import,
        ] {
            assert_eq!(stages_for(mode).last().unwrap().name, "pr_review");
        }
    }

    #[test]
    fn required_stages_include_prd_and_pr_review_where_present() {
        let greenfield = stages_for(PipelineMode::Greenfield);
        assert!(get_stage(PipelineMode::Greenfield, "prd_generation").unwrap().required);
        assert!(get_stage(PipelineMode::Greenfield, "pr_review").unwrap().required);
        assert!(!get_stage(PipelineMode::Greenfield, "srs_generation").unwrap().required);
        assert_eq!(greenfield.len(), 9);
    }

    #[test]
    fn default_gates_match_the_published_set() {
        let gates: Vec<&str> = stages_for(PipelineMode::Greenfield)
            .iter()
            .filter(|s| s.approval_gate)
            .map(|s| s.name)
            .collect();
        assert_eq!(
            gates,
            vec![
                "collection",
                "prd_generation",
                "srs_generation",
                "sds_generation",
                "issue_generation",
                "pr_review"
            ]
        );
    }

    #[test]
    fn impact_scope_gates_update_stages() {
        assert!(ImpactScope::Major.runs("prd_update"));
        assert!(ImpactScope::Major.runs("srs_update"));
        assert!(!ImpactScope::Moderate.runs("prd_update"));
        assert!(ImpactScope::Moderate.runs("srs_update"));
        assert!(!ImpactScope::Minor.runs("prd_update"));
        assert!(!ImpactScope::Minor.runs("srs_update"));
        assert!(ImpactScope::Minor.runs("sds_update"));
    }
}
