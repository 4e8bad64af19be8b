//! Worker pool: bounded-concurrency dispatch of implementation tasks.
//!
//! The controller pops ready issues off the analyzed dependency graph and
//! hands each to a worker slot; workers drive the seven-step implementation
//! sequence through the agent adapter and the git/gh command layer, under
//! the retry layer. Completed results flow into the PR review queue.

pub mod controller;
pub mod orders;
pub mod review;
pub mod worker;

pub use controller::{
    Controller, ControllerConfig, ControllerState, ControllerSummary, SlotStatus, WorkerSnapshot,
};
pub use orders::{
    Assignment, ChangeKind, FileChange, ImplementationResult, VerificationOutcome, WorkOrder,
    WorkOrderContext, WorkOrderStatus,
};
pub use review::{
    GateOutcome, PrReviewer, QualityGates, ReviewBackend, ReviewDecision, ReviewRecord,
};
pub use worker::{Worker, WorkerBackend, WorkerRunResult};

use crate::agent::{AgentInvoker, AgentRequest};
use crate::command::{self, CommandSpec};
use crate::retry::CategorizedError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

/// Commands the verification step runs, in order. Each entry is a program
/// plus arguments; empty entries skip that check (reported as passing).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyCommands {
    #[serde(default)]
    pub test: Vec<String>,
    #[serde(default)]
    pub lint: Vec<String>,
    #[serde(default)]
    pub build: Vec<String>,
    #[serde(default)]
    pub typecheck: Vec<String>,
    /// Optional auto-fix command tried before re-verification.
    #[serde(default)]
    pub fix: Vec<String>,
}

/// Production worker backend: agents for the generative steps, git through
/// the sanitised command layer for branch and commit work.
pub struct AgentWorkerBackend {
    invoker: Arc<dyn AgentInvoker>,
    repo: PathBuf,
    verify: VerifyCommands,
}

impl AgentWorkerBackend {
    pub fn new(invoker: Arc<dyn AgentInvoker>, repo: PathBuf, verify: VerifyCommands) -> Self {
        Self {
            invoker,
            repo,
            verify,
        }
    }

    fn branch_name(order: &WorkOrder) -> String {
        format!(
            "feat/{}-{}",
            order.id.to_lowercase(),
            order.issue_id.to_lowercase()
        )
    }

    async fn invoke_agent(
        &self,
        role: &str,
        prompt: &str,
    ) -> Result<String, CategorizedError> {
        let outcome = self.invoker.invoke(&AgentRequest::new(role, prompt)).await?;
        if outcome.success {
            Ok(outcome.output)
        } else {
            Err(CategorizedError::recoverable(
                outcome
                    .error
                    .unwrap_or_else(|| "agent reported failure".into()),
            ))
        }
    }

    async fn git(&self, args: &[&str]) -> Result<command::CommandOutput, CategorizedError> {
        command::run(&CommandSpec::git(args, &self.repo))
            .await
            .map_err(|e| match e {
                command::CommandError::TimedOut { .. } => {
                    CategorizedError::transient(e.to_string())
                }
                _ => CategorizedError::fatal(e.to_string()),
            })
    }

    async fn run_check(&self, argv: &[String]) -> Result<bool, CategorizedError> {
        Ok(self.run_check_output(argv).await?.0)
    }

    async fn run_check_output(
        &self,
        argv: &[String],
    ) -> Result<(bool, String), CategorizedError> {
        let Some((program, args)) = argv.split_first() else {
            return Ok((true, String::new()));
        };
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let spec = CommandSpec::new(program)
            .with_args(&args)
            .with_cwd(&self.repo);
        let out = command::run(&spec).await.map_err(|e| match e {
            command::CommandError::TimedOut { .. } => CategorizedError::transient(e.to_string()),
            _ => CategorizedError::fatal(e.to_string()),
        })?;
        let combined = format!("{}\n{}", out.stdout, out.stderr);
        Ok((out.success(), combined))
    }

    /// Parse `git diff --numstat` output into file changes.
    fn parse_numstat(numstat: &str, porcelain: &str) -> Vec<FileChange> {
        let kinds: std::collections::HashMap<&str, ChangeKind> = porcelain
            .lines()
            .filter_map(|line| {
                let (status, path) = line.split_at_checked(3)?;
                let kind = match status.trim() {
                    "A" | "??" => ChangeKind::Added,
                    "D" => ChangeKind::Deleted,
                    "R" => ChangeKind::Renamed,
                    _ => ChangeKind::Modified,
                };
                Some((path.trim(), kind))
            })
            .collect();

        numstat
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let added = parts.next()?.parse().unwrap_or(0);
                let removed = parts.next()?.parse().unwrap_or(0);
                let path = parts.next()?;
                Some(FileChange {
                    path: path.to_string(),
                    kind: kinds.get(path).copied().unwrap_or(ChangeKind::Modified),
                    lines_added: added,
                    lines_removed: removed,
                })
            })
            .collect()
    }
}

fn order_prompt(task: &str, order: &WorkOrder) -> String {
    let criteria = if order.acceptance_criteria.is_empty() {
        String::new()
    } else {
        format!(
            "\n\nAcceptance criteria:\n- {}",
            order.acceptance_criteria.join("\n- ")
        )
    };
    let files = if order.context.related_files.is_empty() {
        String::new()
    } else {
        format!(
            "\n\nRelated files:\n- {}",
            order.context.related_files.join("\n- ")
        )
    };
    format!(
        "{task} for issue {} (work order {}).{criteria}{files}",
        order.issue_id, order.id
    )
}

#[async_trait]
impl WorkerBackend for AgentWorkerBackend {
    async fn analyze_context(
        &self,
        order: &WorkOrder,
    ) -> Result<serde_yaml::Value, CategorizedError> {
        let output = self
            .invoke_agent("context-analyzer", &order_prompt("Analyze the context", order))
            .await?;
        Ok(serde_yaml::Value::String(output))
    }

    async fn create_branch(&self, order: &WorkOrder) -> Result<String, CategorizedError> {
        let branch = Self::branch_name(order);
        let exists = self
            .git(&["rev-parse", "--verify", &format!("refs/heads/{branch}")])
            .await?
            .success();

        if exists {
            // Idempotent only when the tip is ours; anything else is
            // refused and escalated rather than guessed at.
            let tip = self.git(&["log", "-1", "--format=%s", &branch]).await?;
            if !tip.stdout.contains(&order.id) {
                return Err(CategorizedError::fatal(format!(
                    "branch {branch} exists with unrelated commits"
                )));
            }
            let checkout = self.git(&["checkout", &branch]).await?;
            if !checkout.success() {
                return Err(CategorizedError::fatal(format!(
                    "failed to check out {branch}: {}",
                    checkout.stderr.trim()
                )));
            }
            return Ok(branch);
        }

        let created = self.git(&["checkout", "-b", &branch]).await?;
        if !created.success() {
            return Err(CategorizedError::fatal(format!(
                "failed to create {branch}: {}",
                created.stderr.trim()
            )));
        }
        Ok(branch)
    }

    async fn generate_code(
        &self,
        order: &WorkOrder,
    ) -> Result<Vec<FileChange>, CategorizedError> {
        self.invoke_agent("implementer", &order_prompt("Implement the change", order))
            .await?;
        let numstat = self.git(&["diff", "--numstat"]).await?;
        let porcelain = self.git(&["status", "--porcelain"]).await?;
        Ok(Self::parse_numstat(&numstat.stdout, &porcelain.stdout))
    }

    async fn generate_tests(
        &self,
        order: &WorkOrder,
    ) -> Result<Vec<String>, CategorizedError> {
        self.invoke_agent("test-writer", &order_prompt("Write tests", order))
            .await?;
        let porcelain = self.git(&["status", "--porcelain"]).await?;
        Ok(porcelain
            .stdout
            .lines()
            .filter_map(|line| line.get(3..))
            .filter(|path| path.contains("test"))
            .map(str::to_string)
            .collect())
    }

    async fn verify(&self, _order: &WorkOrder) -> Result<VerificationOutcome, CategorizedError> {
        // The four checks run in declared order; a failed check still lets
        // the later ones run so the outcome names everything broken.
        let (tests_passed, test_output) = self.run_check_output(&self.verify.test).await?;
        let lint_passed = self.run_check(&self.verify.lint).await?;
        let build_passed = self.run_check(&self.verify.build).await?;
        let typecheck_passed = self.run_check(&self.verify.typecheck).await?;

        Ok(VerificationOutcome {
            tests_passed,
            lint_passed,
            build_passed,
            typecheck_passed,
            coverage_percent: parse_coverage(&test_output).unwrap_or(0.0),
        })
    }

    async fn fix(&self, order: &WorkOrder, failure: &str) -> Result<bool, CategorizedError> {
        if !self.verify.fix.is_empty() {
            return self.run_check(&self.verify.fix).await;
        }
        let before = self.git(&["status", "--porcelain"]).await?.stdout;
        self.invoke_agent(
            "fixer",
            &format!("{}\n\nVerification failed: {failure}", order_prompt("Fix the verification failure", order)),
        )
        .await?;
        let after = self.git(&["status", "--porcelain"]).await?.stdout;
        Ok(before != after)
    }

    async fn commit(
        &self,
        order: &WorkOrder,
        _branch: &str,
    ) -> Result<Vec<String>, CategorizedError> {
        let add = self.git(&["add", "-A"]).await?;
        if !add.success() {
            return Err(CategorizedError::fatal(format!(
                "git add failed: {}",
                add.stderr.trim()
            )));
        }
        let message = format!("{}: implement {}", order.id, order.issue_id);
        let commit = self.git(&["commit", "-m", &message]).await?;
        if !commit.success() {
            return Err(CategorizedError::fatal(format!(
                "git commit failed: {}",
                commit.stderr.trim()
            )));
        }
        let sha = self.git(&["rev-parse", "HEAD"]).await?;
        Ok(vec![sha.stdout.trim().to_string()])
    }
}

static COVERAGE_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?i)coverage[:\s]+([0-9]+(?:\.[0-9]+)?)%").unwrap());

/// Pull a coverage percentage out of tool output, when one is printed.
pub fn parse_coverage(output: &str) -> Option<f64> {
    COVERAGE_RE
        .captures(output)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Production review backend driving the GitHub CLI.
pub struct GhReviewBackend {
    repo: PathBuf,
}

impl GhReviewBackend {
    pub fn new(repo: PathBuf) -> Self {
        Self { repo }
    }

    async fn gh(&self, args: &[&str]) -> Result<command::CommandOutput, CategorizedError> {
        command::run(&CommandSpec::gh(args, &self.repo))
            .await
            .map_err(|e| match e {
                command::CommandError::TimedOut { .. } => {
                    CategorizedError::transient(e.to_string())
                }
                _ => CategorizedError::fatal(e.to_string()),
            })
    }
}

#[async_trait]
impl ReviewBackend for GhReviewBackend {
    async fn open_pr(&self, result: &ImplementationResult) -> Result<String, CategorizedError> {
        let title = format!("{}: {}", result.order_id, result.issue_id);
        let body = format!(
            "Implements {} (work order {}).\n\nCommits:\n- {}",
            result.issue_id,
            result.order_id,
            result.commits.join("\n- ")
        );
        let out = self
            .gh(&[
                "pr", "create", "--head", &result.branch, "--title", &title, "--body", &body,
            ])
            .await?;
        if !out.success() {
            return Err(CategorizedError::transient(format!(
                "gh pr create failed: {}",
                out.stderr.trim()
            )));
        }
        // The PR id mirrors the work order number.
        let number = result.order_id.trim_start_matches("WO-");
        Ok(format!("PR-{number}"))
    }

    async fn security_scan(
        &self,
        _result: &ImplementationResult,
    ) -> Result<bool, CategorizedError> {
        // Hook for an external scanner; absent one, no findings.
        Ok(true)
    }

    async fn merge(&self, pr_id: &str) -> Result<(), CategorizedError> {
        let number = pr_id.trim_start_matches("PR-").trim_start_matches('0');
        let out = self.gh(&["pr", "merge", number, "--squash"]).await?;
        if !out.success() {
            return Err(CategorizedError::transient(format!(
                "gh pr merge failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numstat_parsing_combines_kinds_and_counts() {
        let numstat = "12\t3\tsrc/api.rs\n40\t0\tsrc/new.rs\n";
        let porcelain = " M src/api.rs\n?? src/new.rs\n";
        let changes = AgentWorkerBackend::parse_numstat(numstat, porcelain);

        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].path, "src/api.rs");
        assert_eq!(changes[0].kind, ChangeKind::Modified);
        assert_eq!(changes[0].lines_added, 12);
        assert_eq!(changes[0].lines_removed, 3);
        assert_eq!(changes[1].kind, ChangeKind::Added);
    }

    #[test]
    fn coverage_is_parsed_from_tool_output() {
        assert_eq!(parse_coverage("line coverage: 84.2%"), Some(84.2));
        assert_eq!(parse_coverage("Coverage 72%"), Some(72.0));
        assert_eq!(parse_coverage("no percentages here"), None);
    }

    #[test]
    fn branch_names_are_derived_from_order_and_issue() {
        let order = WorkOrder::new("WO-007", "ISS-012", 100);
        assert_eq!(
            AgentWorkerBackend::branch_name(&order),
            "feat/wo-007-iss-012"
        );
    }

    #[tokio::test]
    async fn empty_check_command_passes_trivially() {
        let backend = AgentWorkerBackend::new(
            Arc::new(crate::agent::ScriptedInvoker::new()),
            PathBuf::from("/tmp"),
            VerifyCommands::default(),
        );
        assert!(backend.run_check(&[]).await.unwrap());
    }
}
