//! Ready-for-review queue processing and quality gates.
//!
//! A completed implementation result is handed to the PR reviewer, which
//! opens a pull request through the GitHub CLI adapter, evaluates the
//! quality gates, and decides merge / request changes / reject. Anything
//! short of a merge re-queues the issue as a new work order.

use crate::pool::orders::ImplementationResult;
use crate::retry::CategorizedError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Minimum coverage to merge.
pub const DEFAULT_COVERAGE_THRESHOLD: f64 = 80.0;

/// Gate thresholds.
#[derive(Debug, Clone)]
pub struct QualityGates {
    pub coverage_threshold: f64,
}

impl Default for QualityGates {
    fn default() -> Self {
        Self {
            coverage_threshold: DEFAULT_COVERAGE_THRESHOLD,
        }
    }
}

/// Individual gate outcomes, persisted with the review.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GateOutcome {
    pub tests_passed: bool,
    pub lint_passed: bool,
    pub build_passed: bool,
    pub coverage_ok: bool,
    pub coverage_percent: f64,
    pub no_critical_findings: bool,
}

impl GateOutcome {
    pub fn all_pass(&self) -> bool {
        self.tests_passed
            && self.lint_passed
            && self.build_passed
            && self.coverage_ok
            && self.no_critical_findings
    }
}

/// Reviewer verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Merge,
    RequestChanges,
    Reject,
}

/// Persisted review record (`PR-NNN-review.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub order_id: String,
    pub issue_id: String,
    pub pr_id: String,
    pub decision: ReviewDecision,
    pub gates: GateOutcome,
    #[serde(default)]
    pub comments: Vec<String>,
    pub reviewed_at: DateTime<Utc>,
}

/// GitHub-side operations the reviewer needs; production wires this to the
/// `gh` CLI through the sanitised command layer.
#[async_trait]
pub trait ReviewBackend: Send + Sync {
    /// Open a PR for the result's branch; returns the PR id.
    async fn open_pr(&self, result: &ImplementationResult) -> Result<String, CategorizedError>;

    /// Whether the change is free of critical security findings.
    async fn security_scan(&self, result: &ImplementationResult)
    -> Result<bool, CategorizedError>;

    /// Merge an approved PR.
    async fn merge(&self, pr_id: &str) -> Result<(), CategorizedError>;
}

/// Evaluates quality gates and drives the PR decision.
pub struct PrReviewer {
    gates: QualityGates,
    backend: std::sync::Arc<dyn ReviewBackend>,
}

impl PrReviewer {
    pub fn new(backend: std::sync::Arc<dyn ReviewBackend>) -> Self {
        Self {
            gates: QualityGates::default(),
            backend,
        }
    }

    pub fn with_gates(mut self, gates: QualityGates) -> Self {
        self.gates = gates;
        self
    }

    /// Review one implementation result end to end.
    pub async fn review(
        &self,
        result: &ImplementationResult,
    ) -> Result<ReviewRecord, CategorizedError> {
        let pr_id = self.backend.open_pr(result).await?;
        let no_critical_findings = self.backend.security_scan(result).await?;

        let v = &result.verification;
        let gates = GateOutcome {
            tests_passed: v.tests_passed,
            lint_passed: v.lint_passed,
            build_passed: v.build_passed,
            coverage_ok: v.coverage_percent >= self.gates.coverage_threshold,
            coverage_percent: v.coverage_percent,
            no_critical_findings,
        };

        let (decision, comments) = self.decide(&gates);
        if decision == ReviewDecision::Merge {
            self.backend.merge(&pr_id).await?;
        }
        info!(
            order = %result.order_id,
            pr = %pr_id,
            ?decision,
            coverage = gates.coverage_percent,
            "review complete"
        );

        Ok(ReviewRecord {
            order_id: result.order_id.clone(),
            issue_id: result.issue_id.clone(),
            pr_id,
            decision,
            gates,
            comments,
            reviewed_at: Utc::now(),
        })
    }

    /// Broken build or failing tests reject outright; a healthy change
    /// that misses a softer gate gets changes requested instead.
    fn decide(&self, gates: &GateOutcome) -> (ReviewDecision, Vec<String>) {
        if gates.all_pass() {
            return (ReviewDecision::Merge, Vec::new());
        }
        let mut comments = Vec::new();
        if !gates.tests_passed {
            comments.push("tests are failing".to_string());
        }
        if !gates.build_passed {
            comments.push("build is broken".to_string());
        }
        if !gates.lint_passed {
            comments.push("lint violations present".to_string());
        }
        if !gates.coverage_ok {
            comments.push(format!(
                "coverage {:.0}% is below the {:.0}% gate",
                gates.coverage_percent, self.gates.coverage_threshold
            ));
        }
        if !gates.no_critical_findings {
            comments.push("critical security findings must be resolved".to_string());
        }

        if !gates.tests_passed || !gates.build_passed {
            (ReviewDecision::Reject, comments)
        } else {
            (ReviewDecision::RequestChanges, comments)
        }
    }
}
