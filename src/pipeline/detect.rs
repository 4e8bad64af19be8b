//! Pipeline mode detection.
//!
//! On entry the orchestrator examines the project directory: an existing
//! `.ad-sdlc/` configuration means an enhancement run; a directory with
//! neither configuration nor source is greenfield; existing GitHub issues
//! without configuration means an import. Anything else is ambiguous and
//! the user is asked.

use crate::model::PipelineMode;
use crate::scratchpad::CONFIG_DIR;
use std::path::Path;

/// Detection result; `Ambiguous` prompts the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    Mode(PipelineMode),
    Ambiguous,
}

/// File names that mark a directory as containing source.
const SOURCE_MARKERS: &[&str] = &[
    "src",
    "lib",
    "Cargo.toml",
    "package.json",
    "pyproject.toml",
    "go.mod",
    "Makefile",
];

/// Inspect the project directory. `has_remote_issues` comes from a prior
/// `gh issue list` probe (the detector itself never touches the network).
pub fn detect_mode(project_dir: &Path, has_remote_issues: bool) -> Detection {
    let config_dir = project_dir.join(CONFIG_DIR).join("config");
    let has_config = config_dir.join("workflow.yaml").exists();
    let has_source = SOURCE_MARKERS
        .iter()
        .any(|m| project_dir.join(m).exists());

    if has_config {
        return Detection::Mode(PipelineMode::Enhancement);
    }
    if has_remote_issues {
        return Detection::Mode(PipelineMode::Import);
    }
    if !has_source {
        return Detection::Mode(PipelineMode::Greenfield);
    }
    // Source without configuration or issues: could be a first enhancement
    // run or an import; the user decides.
    Detection::Ambiguous
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn config_directory_means_enhancement() {
        let dir = tempdir().unwrap();
        let config = dir.path().join(".ad-sdlc/config");
        std::fs::create_dir_all(&config).unwrap();
        std::fs::write(config.join("workflow.yaml"), "mode: {}").unwrap();

        assert_eq!(
            detect_mode(dir.path(), false),
            Detection::Mode(PipelineMode::Enhancement)
        );
        // Config wins even when remote issues exist.
        assert_eq!(
            detect_mode(dir.path(), true),
            Detection::Mode(PipelineMode::Enhancement)
        );
    }

    #[test]
    fn empty_directory_means_greenfield() {
        let dir = tempdir().unwrap();
        assert_eq!(
            detect_mode(dir.path(), false),
            Detection::Mode(PipelineMode::Greenfield)
        );
    }

    #[test]
    fn remote_issues_without_config_means_import() {
        let dir = tempdir().unwrap();
        assert_eq!(
            detect_mode(dir.path(), true),
            Detection::Mode(PipelineMode::Import)
        );
    }

    #[test]
    fn source_without_config_is_ambiguous() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        assert_eq!(detect_mode(dir.path(), false), Detection::Ambiguous);
    }
}
