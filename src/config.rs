//! Workflow and agent configuration.
//!
//! Two YAML files under `.ad-sdlc/config/` drive the pipeline:
//! `workflow.yaml` (worker capacity, timeouts, retry and quality tuning)
//! and `agents.yaml` (role → tools, model class, timeout, permission
//! posture). Environment variables override the file where noted.

use crate::agent::{ModelClass, PermissionPosture, RoleConfig};
use crate::pool::VerifyCommands;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Retry tuning persisted in `workflow.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_secs() -> u64 {
    5
}
fn default_max_delay_secs() -> u64 {
    60
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

/// Top-level workflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Worker pool capacity, clamped to 1..=10.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Bypass all human approval gates.
    #[serde(default)]
    pub skip_approval: bool,
    /// Per-stage agent timeout.
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    /// Verification fix-retry budget inside a worker.
    #[serde(default = "default_verification_retries")]
    pub verification_retries: u32,
    /// Whether PR review consumes a worker slot.
    #[serde(default)]
    pub review_shares_pool: bool,
    /// Minimum coverage to merge.
    #[serde(default = "default_coverage_threshold")]
    pub coverage_threshold: f64,
    /// History ring size; 0 disables history.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub verify: VerifyCommands,
    /// Agent CLI binary.
    #[serde(default = "default_agent_cli")]
    pub agent_cli: String,
}

fn default_max_workers() -> usize {
    5
}
fn default_stage_timeout_secs() -> u64 {
    600
}
fn default_verification_retries() -> u32 {
    3
}
fn default_coverage_threshold() -> f64 {
    80.0
}
fn default_history_limit() -> usize {
    50
}
fn default_agent_cli() -> String {
    "claude".to_string()
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            skip_approval: false,
            stage_timeout_secs: default_stage_timeout_secs(),
            verification_retries: default_verification_retries(),
            review_shares_pool: false,
            coverage_threshold: default_coverage_threshold(),
            history_limit: default_history_limit(),
            retry: RetrySettings::default(),
            verify: VerifyCommands::default(),
            agent_cli: default_agent_cli(),
        }
    }
}

impl WorkflowConfig {
    /// Load from `workflow.yaml`, falling back to defaults when absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow config: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse workflow config: {}", path.display()))?;
        Ok(config.clamped())
    }

    /// Apply `MAX_WORKERS` and `SKIP_APPROVAL` overrides.
    pub fn apply_env(mut self) -> Self {
        if let Ok(raw) = std::env::var("MAX_WORKERS")
            && let Ok(n) = raw.parse::<usize>()
        {
            self.max_workers = n;
        }
        if let Ok(raw) = std::env::var("SKIP_APPROVAL") {
            self.skip_approval = matches!(raw.as_str(), "1" | "true" | "yes");
        }
        self.clamped()
    }

    fn clamped(mut self) -> Self {
        self.max_workers = self.max_workers.clamp(1, 10);
        self
    }
}

/// Agent role registry (`agents.yaml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default)]
    pub roles: BTreeMap<String, RoleConfig>,
}

impl AgentsConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::with_default_roles());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read agents config: {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse agents config: {}", path.display()))
    }

    /// The standard role set scaffolded by `init`.
    pub fn with_default_roles() -> Self {
        let mut roles = BTreeMap::new();
        let read_only = |model: ModelClass| RoleConfig {
            tools: vec!["read".into(), "grep".into(), "glob".into()],
            model,
            timeout_secs: 300,
            permission: PermissionPosture::Readonly,
        };
        let writer = |model: ModelClass| RoleConfig {
            tools: vec!["read".into(), "write".into(), "edit".into()],
            model,
            timeout_secs: 600,
            permission: PermissionPosture::Standard,
        };

        roles.insert("initializer".into(), writer(ModelClass::Haiku));
        roles.insert("collector".into(), read_only(ModelClass::Sonnet));
        roles.insert("doc-reader".into(), read_only(ModelClass::Haiku));
        roles.insert("code-analyzer".into(), read_only(ModelClass::Sonnet));
        roles.insert("code-reader".into(), read_only(ModelClass::Haiku));
        roles.insert("impact-analyzer".into(), read_only(ModelClass::Sonnet));
        roles.insert("prd-writer".into(), writer(ModelClass::Opus));
        roles.insert("srs-writer".into(), writer(ModelClass::Sonnet));
        roles.insert("sds-writer".into(), writer(ModelClass::Sonnet));
        roles.insert("repo-admin".into(), RoleConfig {
            tools: vec!["bash".into()],
            model: ModelClass::Haiku,
            timeout_secs: 300,
            permission: PermissionPosture::Standard,
        });
        roles.insert("issue-writer".into(), writer(ModelClass::Sonnet));
        roles.insert("issue-importer".into(), read_only(ModelClass::Haiku));
        roles.insert("regression-tester".into(), RoleConfig {
            tools: vec!["read".into(), "bash".into()],
            model: ModelClass::Sonnet,
            timeout_secs: 900,
            permission: PermissionPosture::Standard,
        });
        roles.insert("context-analyzer".into(), read_only(ModelClass::Sonnet));
        roles.insert("implementer".into(), RoleConfig {
            tools: vec!["read".into(), "write".into(), "edit".into(), "bash".into()],
            model: ModelClass::Inherit,
            timeout_secs: 1800,
            permission: PermissionPosture::Standard,
        });
        roles.insert("test-writer".into(), writer(ModelClass::Sonnet));
        roles.insert("fixer".into(), writer(ModelClass::Sonnet));
        roles.insert("pr-reviewer".into(), read_only(ModelClass::Opus));

        Self { roles }
    }
}
