//! Agent invocation adapter.
//!
//! A uniform call surface over agent roles: the adapter resolves the
//! role's tool whitelist, model class, timeout, and permission posture
//! from configuration, enforces the caller-supplied token budget, attaches
//! a correlation id for the logger, and masks secrets in outputs before
//! returning. It has no retry logic of its own; the retry layer wraps it.
//!
//! The underlying runtime only permits parent→child calls: an invocation
//! takes a request and returns a final result, nothing else. Agents
//! cooperate across invocations exclusively through the scratchpad.

use crate::command::{self, CommandSpec};
use crate::retry::CategorizedError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

/// Model class an agent role runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelClass {
    Sonnet,
    Opus,
    Haiku,
    /// Use whatever the session default is.
    #[default]
    Inherit,
}

/// Permission posture applied to a role's invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionPosture {
    /// Require approval for every action.
    Strict,
    /// Approve start, auto-continue.
    #[default]
    Standard,
    /// Auto-approve while within budget.
    Autonomous,
    /// Planning/research roles, no file modifications.
    Readonly,
}

/// Declared configuration for one agent role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Tools the role may use; everything else is denied.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub model: ModelClass,
    #[serde(default = "default_role_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub permission: PermissionPosture,
}

fn default_role_timeout_secs() -> u64 {
    600
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            tools: Vec::new(),
            model: ModelClass::Inherit,
            timeout_secs: default_role_timeout_secs(),
            permission: PermissionPosture::Standard,
        }
    }
}

/// One invocation request.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub role: String,
    pub prompt: String,
    /// Stable id threaded through logs for this invocation.
    pub correlation_id: Uuid,
    /// Rough input-token estimate for the budget pre-flight.
    pub estimated_tokens: u32,
}

impl AgentRequest {
    pub fn new(role: &str, prompt: &str) -> Self {
        Self {
            role: role.to_string(),
            prompt: prompt.to_string(),
            correlation_id: Uuid::new_v4(),
            // Order-of-magnitude estimate; the budget interface refines it.
            estimated_tokens: (prompt.len() / 4) as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Result of one agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    #[serde(default)]
    pub token_usage: Option<TokenUsage>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Caller-supplied token/cost budget.
pub trait TokenBudget: Send + Sync {
    /// Reject the call outright when the estimate would bust the budget.
    fn preflight(&self, role: &str, estimated_tokens: u32) -> Result<(), String>;
    /// Post-call accounting.
    fn record(&self, role: &str, usage: &TokenUsage);
}

/// Budget that admits everything; the default for local runs.
#[derive(Debug, Default)]
pub struct UnlimitedBudget;

impl TokenBudget for UnlimitedBudget {
    fn preflight(&self, _role: &str, _estimated_tokens: u32) -> Result<(), String> {
        Ok(())
    }
    fn record(&self, _role: &str, _usage: &TokenUsage) {}
}

/// Uniform call interface to agent roles.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutcome, CategorizedError>;
}

/// Resolve a role's config or fail fatal: an unknown role is a
/// configuration error, not something retries can cure.
pub fn resolve_role<'a>(
    roles: &'a std::collections::BTreeMap<String, RoleConfig>,
    role: &str,
) -> Result<&'a RoleConfig, CategorizedError> {
    roles
        .get(role)
        .ok_or_else(|| CategorizedError::fatal(format!("no configuration for agent role '{role}'")))
}

/// Production invoker: shells out to the agent CLI through the sanitised
/// command layer.
pub struct CliAgentInvoker {
    cli: String,
    workdir: PathBuf,
    roles: std::collections::BTreeMap<String, RoleConfig>,
    budget: Arc<dyn TokenBudget>,
}

impl CliAgentInvoker {
    pub fn new(
        cli: &str,
        workdir: PathBuf,
        roles: std::collections::BTreeMap<String, RoleConfig>,
    ) -> Self {
        Self {
            cli: cli.to_string(),
            workdir,
            roles,
            budget: Arc::new(UnlimitedBudget),
        }
    }

    pub fn with_budget(mut self, budget: Arc<dyn TokenBudget>) -> Self {
        self.budget = budget;
        self
    }

    fn build_spec(&self, request: &AgentRequest, role: &RoleConfig) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.cli)
            .with_cwd(&self.workdir)
            .with_stdin(&request.prompt)
            .with_timeout(Duration::from_secs(role.timeout_secs));
        if role.model != ModelClass::Inherit {
            let model = match role.model {
                ModelClass::Sonnet => "sonnet",
                ModelClass::Opus => "opus",
                ModelClass::Haiku => "haiku",
                ModelClass::Inherit => unreachable!(),
            };
            spec = spec.with_args(&["--model", model]);
        }
        if !role.tools.is_empty() {
            spec = spec.with_arg("--allowed-tools").with_arg(&role.tools.join(","));
        }
        if role.permission == PermissionPosture::Readonly {
            spec = spec.with_arg("--read-only");
        }
        spec
    }
}

#[async_trait]
impl AgentInvoker for CliAgentInvoker {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutcome, CategorizedError> {
        let role = resolve_role(&self.roles, &request.role)?;

        self.budget
            .preflight(&request.role, request.estimated_tokens)
            .map_err(CategorizedError::fatal)?;

        let span = tracing::info_span!(
            "agent_invocation",
            role = %request.role,
            correlation_id = %request.correlation_id
        );

        let spec = self.build_spec(request, role);
        let output = command::run(&spec)
            .instrument(span)
            .await
            .map_err(|e| match e {
                command::CommandError::TimedOut { .. } => {
                    CategorizedError::transient(e.to_string())
                }
                _ => CategorizedError::fatal(e.to_string()),
            })?;

        let usage = TokenUsage {
            input_tokens: request.estimated_tokens,
            output_tokens: (output.stdout.len() / 4) as u32,
        };
        self.budget.record(&request.role, &usage);

        if output.success() {
            Ok(AgentOutcome {
                success: true,
                output: mask_secrets(&output.stdout),
                artifacts: Vec::new(),
                token_usage: Some(usage),
                error: None,
            })
        } else {
            Ok(AgentOutcome {
                success: false,
                output: mask_secrets(&output.stdout),
                artifacts: Vec::new(),
                token_usage: Some(usage),
                error: Some(mask_secrets(&output.stderr)),
            })
        }
    }
}

/// Scripted invoker for tests and dry runs: hands out canned outcomes per
/// role and records every request it sees.
#[derive(Default)]
pub struct ScriptedInvoker {
    outcomes: Mutex<std::collections::HashMap<String, Vec<AgentOutcome>>>,
    pub invocations: Mutex<Vec<AgentRequest>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome for a role; consumed in FIFO order.
    pub fn script(&self, role: &str, outcome: AgentOutcome) {
        self.outcomes
            .lock()
            .expect("scripted outcomes")
            .entry(role.to_string())
            .or_default()
            .push(outcome);
    }

    /// Convenience: a role that always succeeds with the given output.
    pub fn succeed(&self, role: &str, output: &str) {
        self.script(
            role,
            AgentOutcome {
                success: true,
                output: output.to_string(),
                artifacts: Vec::new(),
                token_usage: None,
                error: None,
            },
        );
    }
}

#[async_trait]
impl AgentInvoker for ScriptedInvoker {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutcome, CategorizedError> {
        self.invocations
            .lock()
            .expect("scripted invocations")
            .push(request.clone());
        let mut outcomes = self.outcomes.lock().expect("scripted outcomes");
        let queue = outcomes.get_mut(&request.role);
        match queue.and_then(|q| if q.is_empty() { None } else { Some(q.remove(0)) }) {
            Some(outcome) => Ok(outcome),
            None => Ok(AgentOutcome {
                success: true,
                output: format!("scripted default for {}", request.role),
                artifacts: Vec::new(),
                token_usage: None,
                error: None,
            }),
        }
    }
}

static SECRET_PATTERNS: LazyLock<Vec<regex::Regex>> = LazyLock::new(|| {
    [
        r"sk-[A-Za-z0-9_-]{8,}",
        r"ghp_[A-Za-z0-9]{8,}",
        r"github_pat_[A-Za-z0-9_]{8,}",
        r"(?i)bearer\s+[A-Za-z0-9._~+/=-]{8,}",
    ]
    .iter()
    .map(|p| regex::Regex::new(p).expect("valid secret pattern"))
    .collect()
});

/// Env vars whose values are scrubbed from outputs wherever they appear.
const CREDENTIAL_ENV_VARS: [&str; 2] = ["ANTHROPIC_API_KEY", "GITHUB_TOKEN"];

/// Replace credential-shaped substrings with `[REDACTED]`.
pub fn mask_secrets(text: &str) -> String {
    let mut masked = text.to_string();
    for pattern in SECRET_PATTERNS.iter() {
        masked = pattern.replace_all(&masked, "[REDACTED]").into_owned();
    }
    for var in CREDENTIAL_ENV_VARS {
        if let Ok(value) = std::env::var(var)
            && value.len() >= 8
        {
            masked = masked.replace(&value, "[REDACTED]");
        }
    }
    masked
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn mask_secrets_scrubs_known_token_shapes() {
        let text = "key sk-ant-abc123def456 and ghp_0123456789abcdef and Bearer abcdef123456";
        let masked = mask_secrets(text);
        assert!(!masked.contains("sk-ant-abc123def456"));
        assert!(!masked.contains("ghp_0123456789abcdef"));
        assert!(!masked.contains("abcdef123456"));
        assert!(masked.contains("[REDACTED]"));
    }

    #[test]
    fn mask_secrets_leaves_plain_text_alone() {
        let text = "implemented FR-001 in src/api.rs";
        assert_eq!(mask_secrets(text), text);
    }

    #[test]
    fn resolve_role_rejects_unknown_roles_as_fatal() {
        let roles = BTreeMap::new();
        let err = resolve_role(&roles, "prd-writer").unwrap_err();
        assert_eq!(err.category, crate::errors::ErrorCategory::Fatal);
    }

    #[test]
    fn cli_spec_applies_model_tools_and_posture() {
        let mut roles = BTreeMap::new();
        roles.insert(
            "code-reader".to_string(),
            RoleConfig {
                tools: vec!["read".into(), "grep".into()],
                model: ModelClass::Haiku,
                timeout_secs: 120,
                permission: PermissionPosture::Readonly,
            },
        );
        let invoker = CliAgentInvoker::new("claude", PathBuf::from("/tmp"), roles.clone());
        let request = AgentRequest::new("code-reader", "analyze the codebase");
        let spec = invoker.build_spec(&request, &roles["code-reader"]);

        assert_eq!(spec.program, "claude");
        assert!(spec.args.contains(&"--model".to_string()));
        assert!(spec.args.contains(&"haiku".to_string()));
        assert!(spec.args.contains(&"read,grep".to_string()));
        assert!(spec.args.contains(&"--read-only".to_string()));
        assert_eq!(spec.timeout, Duration::from_secs(120));
    }

    #[tokio::test]
    async fn scripted_invoker_replays_in_fifo_order() {
        let invoker = ScriptedInvoker::new();
        invoker.succeed("collector", "first");
        invoker.succeed("collector", "second");

        let req = AgentRequest::new("collector", "collect requirements");
        assert_eq!(invoker.invoke(&req).await.unwrap().output, "first");
        assert_eq!(invoker.invoke(&req).await.unwrap().output, "second");
        assert_eq!(invoker.invocations.lock().unwrap().len(), 2);
    }

    #[test]
    fn request_estimates_tokens_from_prompt_length() {
        let request = AgentRequest::new("writer", &"x".repeat(400));
        assert_eq!(request.estimated_tokens, 100);
    }
}
