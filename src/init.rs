//! Project scaffolding.
//!
//! `ad-sdlc init` creates the `.ad-sdlc/` tree:
//!
//! ```text
//! .ad-sdlc/
//! ├── config/
//! │   ├── workflow.yaml    # pipeline tuning, defaults written once
//! │   └── agents.yaml      # role registry
//! ├── scratchpad/
//! │   ├── info/  documents/  issues/  progress/
//! │   ├── checkpoints/
//! │   └── history/
//! ├── sessions/
//! └── logs/
//! ```
//!
//! Initialization is idempotent: a second run leaves existing files
//! byte-for-byte untouched and only fills in missing pieces.

use crate::config::{AgentsConfig, WorkflowConfig};
use crate::scratchpad::CONFIG_DIR;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Result of initializing a project directory.
#[derive(Debug)]
pub struct InitResult {
    /// Path to the `.ad-sdlc` directory.
    pub root: PathBuf,
    /// Whether the directory was newly created.
    pub created: bool,
}

const SUBDIRS: &[&str] = &[
    "config",
    "scratchpad/info",
    "scratchpad/documents",
    "scratchpad/issues",
    "scratchpad/progress",
    "scratchpad/checkpoints",
    "scratchpad/history",
    "sessions",
    "logs",
];

/// Create the `.ad-sdlc/` structure in `project_dir`.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let root = project_dir.join(CONFIG_DIR);
    let created = !root.exists();

    for sub in SUBDIRS {
        let dir = root.join(sub);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }

    let workflow = root.join("config/workflow.yaml");
    if !workflow.exists() {
        let body = serde_yaml::to_string(&WorkflowConfig::default())
            .context("Failed to serialize default workflow config")?;
        std::fs::write(&workflow, body)
            .with_context(|| format!("Failed to write {}", workflow.display()))?;
    }

    let agents = root.join("config/agents.yaml");
    if !agents.exists() {
        let body = serde_yaml::to_string(&AgentsConfig::with_default_roles())
            .context("Failed to serialize default agents config")?;
        std::fs::write(&agents, body)
            .with_context(|| format!("Failed to write {}", agents.display()))?;
    }

    Ok(InitResult { root, created })
}

/// Whether a project directory has been initialized.
pub fn is_initialized(project_dir: &Path) -> bool {
    project_dir
        .join(CONFIG_DIR)
        .join("config/workflow.yaml")
        .exists()
}

/// Path to the `.ad-sdlc` root for a project.
pub fn config_root(project_dir: &Path) -> PathBuf {
    project_dir.join(CONFIG_DIR)
}
