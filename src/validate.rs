//! Artifact validation before stage execution.
//!
//! A static per-mode map names, for each stage, the glob patterns of its
//! required and optional outputs. When the orchestrator plans to treat a
//! stage as pre-completed during resume, the validator checks the disk; a
//! stage missing a required artifact is evicted from the pre-completed set
//! and re-executed. The validator is a pure function of disk state.

use crate::model::PipelineMode;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Declared outputs of one stage.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactSpec {
    pub stage: &'static str,
    pub label: &'static str,
    /// Globs relative to the `.ad-sdlc` root; `{projectId}` is substituted.
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
}

const GREENFIELD_ARTIFACTS: &[ArtifactSpec] = &[
    ArtifactSpec {
        stage: "initialization",
        label: "Project scaffold",
        required: &["config/workflow.yaml", "config/agents.yaml"],
        optional: &[],
    },
    ArtifactSpec {
        stage: "collection",
        label: "Collected requirements",
        required: &["scratchpad/info/{projectId}/collected_info.yaml"],
        optional: &[],
    },
    ArtifactSpec {
        stage: "prd_generation",
        label: "Product requirements document",
        required: &["scratchpad/documents/{projectId}/prd.md"],
        optional: &[],
    },
    ArtifactSpec {
        stage: "srs_generation",
        label: "Software requirements specification",
        required: &["scratchpad/documents/{projectId}/srs.md"],
        optional: &[],
    },
    ArtifactSpec {
        stage: "sds_generation",
        label: "Software design specification",
        required: &["scratchpad/documents/{projectId}/sds.md"],
        optional: &[],
    },
    ArtifactSpec {
        stage: "github_repo_setup",
        label: "GitHub repository",
        required: &[],
        optional: &["scratchpad/info/{projectId}/repo.yaml"],
    },
    ArtifactSpec {
        stage: "issue_generation",
        label: "Issue list and dependency graph",
        required: &[
            "scratchpad/issues/{projectId}/issue_list.json",
            "scratchpad/issues/{projectId}/dependency_graph.json",
        ],
        optional: &[],
    },
    ArtifactSpec {
        stage: "implementation",
        label: "Implementation results",
        required: &["scratchpad/progress/{projectId}/results/*-result.yaml"],
        optional: &["scratchpad/progress/{projectId}/work_orders/*.yaml"],
    },
    ArtifactSpec {
        stage: "pr_review",
        label: "Pull request reviews",
        required: &[],
        optional: &["scratchpad/progress/{projectId}/reviews/*-review.yaml"],
    },
];

const ENHANCEMENT_ARTIFACTS: &[ArtifactSpec] = &[
    ArtifactSpec {
        stage: "initialization",
        label: "Project scaffold",
        required: &["config/workflow.yaml", "config/agents.yaml"],
        optional: &[],
    },
    ArtifactSpec {
        stage: "document_reading",
        label: "Existing document survey",
        required: &[],
        optional: &["scratchpad/info/{projectId}/document_survey.yaml"],
    },
    ArtifactSpec {
        stage: "codebase_analysis",
        label: "Codebase analysis notes",
        required: &["scratchpad/info/{projectId}/codebase_analysis.yaml"],
        optional: &[],
    },
    ArtifactSpec {
        stage: "code_reading",
        label: "Focused code reading notes",
        required: &[],
        optional: &["scratchpad/info/{projectId}/code_reading.yaml"],
    },
    ArtifactSpec {
        stage: "impact_analysis",
        label: "Impact analysis",
        required: &["scratchpad/info/{projectId}/impact_analysis.yaml"],
        optional: &[],
    },
    ArtifactSpec {
        stage: "prd_update",
        label: "Updated PRD",
        required: &["scratchpad/documents/{projectId}/prd.md"],
        optional: &[],
    },
    ArtifactSpec {
        stage: "srs_update",
        label: "Updated SRS",
        required: &["scratchpad/documents/{projectId}/srs.md"],
        optional: &[],
    },
    ArtifactSpec {
        stage: "sds_update",
        label: "Updated SDS",
        required: &["scratchpad/documents/{projectId}/sds.md"],
        optional: &[],
    },
    ArtifactSpec {
        stage: "issue_generation",
        label: "Issue list and dependency graph",
        required: &[
            "scratchpad/issues/{projectId}/issue_list.json",
            "scratchpad/issues/{projectId}/dependency_graph.json",
        ],
        optional: &[],
    },
    ArtifactSpec {
        stage: "regression_testing",
        label: "Regression baseline",
        required: &[],
        optional: &["scratchpad/info/{projectId}/regression_baseline.yaml"],
    },
    ArtifactSpec {
        stage: "implementation",
        label: "Implementation results",
        required: &["scratchpad/progress/{projectId}/results/*-result.yaml"],
        optional: &["scratchpad/progress/{projectId}/work_orders/*.yaml"],
    },
    ArtifactSpec {
        stage: "pr_review",
        label: "Pull request reviews",
        required: &[],
        optional: &["scratchpad/progress/{projectId}/reviews/*-review.yaml"],
    },
];

const IMPORT_ARTIFACTS: &[ArtifactSpec] = &[
    ArtifactSpec {
        stage: "initialization",
        label: "Project scaffold",
        required: &["config/workflow.yaml", "config/agents.yaml"],
        optional: &[],
    },
    ArtifactSpec {
        stage: "issue_import",
        label: "Imported issues",
        required: &["scratchpad/issues/{projectId}/issue_list.json"],
        optional: &["scratchpad/issues/{projectId}/dependency_graph.json"],
    },
    ArtifactSpec {
        stage: "implementation",
        label: "Implementation results",
        required: &["scratchpad/progress/{projectId}/results/*-result.yaml"],
        optional: &["scratchpad/progress/{projectId}/work_orders/*.yaml"],
    },
    ArtifactSpec {
        stage: "pr_review",
        label: "Pull request reviews",
        required: &[],
        optional: &["scratchpad/progress/{projectId}/reviews/*-review.yaml"],
    },
];

/// The artifact map for a mode.
pub fn artifact_specs(mode: PipelineMode) -> &'static [ArtifactSpec] {
    match mode {
        PipelineMode::Greenfield => GREENFIELD_ARTIFACTS,
        PipelineMode::Enhancement => ENHANCEMENT_ARTIFACTS,
        PipelineMode::Import => IMPORT_ARTIFACTS,
    }
}

/// Result of checking one stage's declared outputs against the disk.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub valid: bool,
    pub stage: String,
    /// Required patterns with no match.
    pub missing: Vec<String>,
    /// Every file matched by a required or optional pattern.
    pub found: Vec<PathBuf>,
}

/// Check a stage's artifacts on disk. A stage unknown to the mode's map is
/// trivially valid (it has no declared outputs).
pub fn validate_stage(
    root: &Path,
    project_id: &str,
    mode: PipelineMode,
    stage: &str,
) -> ValidationReport {
    let Some(spec) = artifact_specs(mode).iter().find(|s| s.stage == stage) else {
        return ValidationReport {
            valid: true,
            stage: stage.to_string(),
            missing: Vec::new(),
            found: Vec::new(),
        };
    };

    let mut missing = Vec::new();
    let mut found = Vec::new();

    for pattern in spec.required {
        let matches = expand(root, project_id, pattern);
        if matches.is_empty() {
            missing.push((*pattern).to_string());
        } else {
            found.extend(matches);
        }
    }
    for pattern in spec.optional {
        let matches = expand(root, project_id, pattern);
        if matches.is_empty() {
            warn!(stage, pattern, "optional artifact missing");
        } else {
            found.extend(matches);
        }
    }

    ValidationReport {
        valid: missing.is_empty(),
        stage: stage.to_string(),
        missing,
        found,
    }
}

/// Filter a pre-completed stage set: stages whose required artifacts are
/// gone are evicted and must re-run.
pub fn prune_pre_completed(
    root: &Path,
    project_id: &str,
    mode: PipelineMode,
    stages: &BTreeSet<String>,
) -> (BTreeSet<String>, Vec<ValidationReport>) {
    let mut retained = BTreeSet::new();
    let mut evicted = Vec::new();
    for stage in stages {
        let report = validate_stage(root, project_id, mode, stage);
        if report.valid {
            retained.insert(stage.clone());
        } else {
            warn!(
                stage = %report.stage,
                missing = ?report.missing,
                "pre-completed stage evicted: required artifact missing"
            );
            evicted.push(report);
        }
    }
    (retained, evicted)
}

fn expand(root: &Path, project_id: &str, pattern: &str) -> Vec<PathBuf> {
    let full = root
        .join(pattern.replace("{projectId}", project_id))
        .to_string_lossy()
        .into_owned();
    glob::glob(&full)
        .map(|paths| paths.filter_map(|p| p.ok()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "x").unwrap();
    }

    #[test]
    fn stage_with_artifacts_present_is_valid() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "scratchpad/documents/p1/prd.md");

        let report = validate_stage(dir.path(), "p1", PipelineMode::Greenfield, "prd_generation");
        assert!(report.valid);
        assert_eq!(report.found.len(), 1);
        assert!(report.missing.is_empty());
    }

    #[test]
    fn missing_required_artifact_invalidates_the_stage() {
        let dir = tempdir().unwrap();
        let report = validate_stage(dir.path(), "p1", PipelineMode::Greenfield, "prd_generation");
        assert!(!report.valid);
        assert_eq!(
            report.missing,
            vec!["scratchpad/documents/{projectId}/prd.md"]
        );
    }

    #[test]
    fn missing_optional_artifact_only_warns() {
        let dir = tempdir().unwrap();
        // pr_review has only optional outputs.
        let report = validate_stage(dir.path(), "p1", PipelineMode::Greenfield, "pr_review");
        assert!(report.valid);
    }

    #[test]
    fn glob_patterns_match_numbered_results() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "scratchpad/progress/p1/results/WO-001-result.yaml");
        touch(dir.path(), "scratchpad/progress/p1/results/WO-002-result.yaml");

        let report = validate_stage(dir.path(), "p1", PipelineMode::Greenfield, "implementation");
        assert!(report.valid);
        assert_eq!(report.found.len(), 2);
    }

    #[test]
    fn prune_evicts_stages_with_deleted_artifacts() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "scratchpad/info/p1/collected_info.yaml");
        // PRD was deleted externally after the prior session completed.

        let stages: BTreeSet<String> = ["collection".to_string(), "prd_generation".to_string()]
            .into_iter()
            .collect();
        let (retained, evicted) =
            prune_pre_completed(dir.path(), "p1", PipelineMode::Greenfield, &stages);

        assert!(retained.contains("collection"));
        assert!(!retained.contains("prd_generation"));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].stage, "prd_generation");
    }

    #[test]
    fn validator_is_a_pure_function_of_disk_state() {
        let dir = tempdir().unwrap();
        let before = validate_stage(dir.path(), "p1", PipelineMode::Greenfield, "prd_generation");
        touch(dir.path(), "scratchpad/documents/p1/prd.md");
        let after = validate_stage(dir.path(), "p1", PipelineMode::Greenfield, "prd_generation");
        assert!(!before.valid);
        assert!(after.valid);
    }

    #[test]
    fn unknown_stage_has_no_declared_outputs() {
        let dir = tempdir().unwrap();
        let report = validate_stage(dir.path(), "p1", PipelineMode::Import, "prd_generation");
        assert!(report.valid);
    }

    #[test]
    fn every_mode_declares_initialization_and_pr_review() {
        for mode in [
            PipelineMode::Greenfield,
            PipelineMode::Enhancement,
            PipelineMode::Import,
        ] {
            let specs = artifact_specs(mode);
            assert!(specs.iter().any(|s| s.stage == "initialization"));
            assert!(specs.iter().any(|s| s.stage == "pr_review"));
        }
    }
}
