//! Worker execution: the seven-step sequence for one work order.
//!
//! Steps run strictly in order. Each step entry persists a checkpoint, so
//! a crash resumes at the interrupted step if it is resumable and at
//! code generation otherwise. Verification carries its own fix-retry
//! budget, separate from the transport retry that wraps individual agent
//! and git calls; the budgets are never multiplied.

use crate::errors::ErrorCategory;
use crate::pool::orders::{
    FileChange, ImplementationResult, VerificationOutcome, WorkOrder, WorkOrderStatus,
};
use crate::retry::{CategorizedError, RetryContext, RetryLayer};
use crate::scratchpad::{Scratchpad, Section, WorkerStep};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default fix-retry budget for the verification step.
pub const DEFAULT_VERIFICATION_RETRIES: u32 = 3;

/// The operations a worker needs from the outside world. Production wires
/// this to the agent invoker and the git/gh command layer; tests script it.
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    /// Step 1: gather the context the implementation needs.
    async fn analyze_context(
        &self,
        order: &WorkOrder,
    ) -> Result<serde_yaml::Value, CategorizedError>;

    /// Step 2: create (or reuse) the work branch. Idempotent when the
    /// branch already exists with our own commits; a branch with unrelated
    /// commits must be refused with a fatal error.
    async fn create_branch(&self, order: &WorkOrder) -> Result<String, CategorizedError>;

    /// Step 3: generate the implementation.
    async fn generate_code(&self, order: &WorkOrder)
    -> Result<Vec<FileChange>, CategorizedError>;

    /// Step 4: generate tests.
    async fn generate_tests(&self, order: &WorkOrder) -> Result<Vec<String>, CategorizedError>;

    /// Step 5: run tests, lint, build, typecheck in that order.
    async fn verify(&self, order: &WorkOrder) -> Result<VerificationOutcome, CategorizedError>;

    /// Attempt an automatic fix after a verification failure. Returns
    /// whether any progress was made.
    async fn fix(&self, order: &WorkOrder, failure: &str) -> Result<bool, CategorizedError>;

    /// Step 6: commit the work atomically. Returns the commit shas.
    async fn commit(
        &self,
        order: &WorkOrder,
        branch: &str,
    ) -> Result<Vec<String>, CategorizedError>;
}

/// Accumulated step outputs, checkpointed between steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StepState {
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<serde_yaml::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch: Option<String>,
    #[serde(default)]
    changes: Vec<FileChange>,
    #[serde(default)]
    test_artifacts: Vec<String>,
}

/// Result of running one order to a terminal state.
#[derive(Debug)]
pub struct WorkerRunResult {
    pub order: WorkOrder,
    pub result: Option<ImplementationResult>,
    /// Set when the run ended in escalation rather than success.
    pub escalated: bool,
}

/// One logical worker slot executing orders sequentially.
pub struct Worker {
    pub id: String,
    project_id: String,
    backend: Arc<dyn WorkerBackend>,
    retry: RetryLayer,
    scratchpad: Scratchpad,
    verification_retries: u32,
}

impl Worker {
    pub fn new(
        id: &str,
        project_id: &str,
        backend: Arc<dyn WorkerBackend>,
        retry: RetryLayer,
        scratchpad: Scratchpad,
    ) -> Self {
        Self {
            id: id.to_string(),
            project_id: project_id.to_string(),
            backend,
            retry,
            scratchpad,
            verification_retries: DEFAULT_VERIFICATION_RETRIES,
        }
    }

    pub fn with_verification_retries(mut self, retries: u32) -> Self {
        self.verification_retries = retries;
        self
    }

    /// Execute the step sequence for an order, resuming from a checkpoint
    /// when one exists.
    pub async fn run(&self, mut order: WorkOrder) -> WorkerRunResult {
        let ctx = RetryContext::new(&self.project_id, &order.id, &self.id);

        let (start_step, mut state) = match self.retry.load_checkpoint(&ctx) {
            Ok(Some(cp)) => {
                let resume = cp.step.resume_step();
                info!(
                    order = %order.id,
                    interrupted = %cp.step,
                    resume = %resume,
                    "resuming from checkpoint"
                );
                let state = serde_yaml::from_value(cp.state).unwrap_or_default();
                (resume, state)
            }
            Ok(None) => (WorkerStep::ContextAnalysis, StepState::default()),
            Err(e) => {
                warn!(order = %order.id, "checkpoint unreadable, starting fresh: {e}");
                (WorkerStep::ContextAnalysis, StepState::default())
            }
        };

        let mut step = Some(start_step);
        let mut verification = VerificationOutcome::default();
        let mut commits: Vec<String> = Vec::new();

        while let Some(current) = step {
            if let Err(err) = self.checkpoint(&ctx, current, &state) {
                warn!(order = %order.id, step = %current, "checkpoint write failed: {err}");
            }
            debug!(order = %order.id, worker = %self.id, step = %current, "executing step");

            let step_result = match current {
                WorkerStep::ContextAnalysis => self.run_context_analysis(&ctx, &order, &mut state).await,
                WorkerStep::BranchCreation => self.run_branch_creation(&ctx, &order, &mut state).await,
                WorkerStep::CodeGeneration => self.run_code_generation(&ctx, &order, &mut state).await,
                WorkerStep::TestGeneration => self.run_test_generation(&ctx, &order, &mut state).await,
                WorkerStep::Verification => match self.run_verification(&order).await {
                    Ok(outcome) => {
                        verification = outcome;
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
                WorkerStep::Commit => {
                    let branch = state.branch.clone().unwrap_or_default();
                    match self.run_commit(&ctx, &order, &branch).await {
                        Ok(shas) => {
                            commits = shas;
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                WorkerStep::ResultPersistence => {
                    let result = self.build_result(&order, &state, verification, &commits, true);
                    match self.persist_result(&result) {
                        Ok(()) => {
                            order.finish(WorkOrderStatus::Completed);
                            self.clear_checkpoint(&ctx);
                            return WorkerRunResult {
                                order,
                                result: Some(result),
                                escalated: false,
                            };
                        }
                        Err(e) => Err(CategorizedError::fatal(e.to_string())),
                    }
                }
            };

            match step_result {
                Ok(()) => step = current.next(),
                Err(err) => {
                    let terminal = match err.category {
                        ErrorCategory::Recoverable => WorkOrderStatus::Failed,
                        _ => WorkOrderStatus::Blocked,
                    };
                    order.finish(terminal);
                    let result = self.build_result(&order, &state, verification, &commits, false);
                    if let Err(e) = self.persist_result(&result) {
                        warn!(order = %order.id, "failed to persist terminal result: {e}");
                    }
                    return WorkerRunResult {
                        order,
                        result: Some(result),
                        escalated: true,
                    };
                }
            }
        }

        // The loop only exits through result persistence.
        order.finish(WorkOrderStatus::Failed);
        WorkerRunResult {
            order,
            result: None,
            escalated: true,
        }
    }

    async fn run_context_analysis(
        &self,
        ctx: &RetryContext,
        order: &WorkOrder,
        state: &mut StepState,
    ) -> Result<(), CategorizedError> {
        let backend = self.backend.clone();
        let outcome = self
            .retry
            .execute(&ctx.clone().with_service("agent"), |_| {
                backend.analyze_context(order)
            })
            .await;
        match outcome.data {
            Some(context) => {
                state.context = Some(context);
                Ok(())
            }
            None => Err(outcome
                .error
                .unwrap_or_else(|| CategorizedError::fatal("context analysis produced no data"))),
        }
    }

    async fn run_branch_creation(
        &self,
        ctx: &RetryContext,
        order: &WorkOrder,
        state: &mut StepState,
    ) -> Result<(), CategorizedError> {
        let backend = self.backend.clone();
        let outcome = self
            .retry
            .execute(&ctx.clone().with_service("git"), |_| {
                backend.create_branch(order)
            })
            .await;
        match outcome.data {
            Some(branch) => {
                state.branch = Some(branch);
                Ok(())
            }
            None => Err(outcome
                .error
                .unwrap_or_else(|| CategorizedError::fatal("branch creation produced no data"))),
        }
    }

    async fn run_code_generation(
        &self,
        ctx: &RetryContext,
        order: &WorkOrder,
        state: &mut StepState,
    ) -> Result<(), CategorizedError> {
        let backend = self.backend.clone();
        let outcome = self
            .retry
            .execute(&ctx.clone().with_service("agent"), |_| {
                backend.generate_code(order)
            })
            .await;
        match outcome.data {
            Some(changes) => {
                state.changes = changes;
                Ok(())
            }
            None => Err(outcome
                .error
                .unwrap_or_else(|| CategorizedError::fatal("code generation produced no data"))),
        }
    }

    async fn run_test_generation(
        &self,
        ctx: &RetryContext,
        order: &WorkOrder,
        state: &mut StepState,
    ) -> Result<(), CategorizedError> {
        let backend = self.backend.clone();
        let outcome = self
            .retry
            .execute(&ctx.clone().with_service("agent"), |_| {
                backend.generate_tests(order)
            })
            .await;
        match outcome.data {
            Some(artifacts) => {
                state.test_artifacts = artifacts;
                Ok(())
            }
            None => Err(outcome
                .error
                .unwrap_or_else(|| CategorizedError::fatal("test generation produced no data"))),
        }
    }

    /// Verification with its own fix-retry budget. Each failed pass must
    /// see fix progress before another verification run is spent.
    async fn run_verification(
        &self,
        order: &WorkOrder,
    ) -> Result<VerificationOutcome, CategorizedError> {
        let mut last_failure = String::new();
        for attempt in 1..=self.verification_retries {
            let outcome = self.backend.verify(order).await?;
            if outcome.all_passed() {
                return Ok(outcome);
            }
            last_failure = describe_verification_failure(&outcome);
            debug!(
                order = %order.id,
                attempt,
                budget = self.verification_retries,
                "verification failed: {last_failure}"
            );
            if attempt < self.verification_retries {
                let progressed = self.backend.fix(order, &last_failure).await?;
                if !progressed {
                    return Err(CategorizedError::recoverable(format!(
                        "verification stalled, fix made no progress: {last_failure}"
                    )));
                }
            }
        }
        Err(CategorizedError::recoverable(format!(
            "verification failed after {} attempts: {last_failure}",
            self.verification_retries
        )))
    }

    async fn run_commit(
        &self,
        ctx: &RetryContext,
        order: &WorkOrder,
        branch: &str,
    ) -> Result<Vec<String>, CategorizedError> {
        let backend = self.backend.clone();
        let outcome = self
            .retry
            .execute(&ctx.clone().with_service("git"), |_| {
                backend.commit(order, branch)
            })
            .await;
        outcome.data.ok_or_else(|| {
            outcome
                .error
                .unwrap_or_else(|| CategorizedError::fatal("commit produced no data"))
        })
    }

    fn build_result(
        &self,
        order: &WorkOrder,
        state: &StepState,
        verification: VerificationOutcome,
        commits: &[String],
        success: bool,
    ) -> ImplementationResult {
        ImplementationResult {
            order_id: order.id.clone(),
            issue_id: order.issue_id.clone(),
            branch: state.branch.clone().unwrap_or_default(),
            changes: state.changes.clone(),
            test_artifacts: state.test_artifacts.clone(),
            verification,
            commits: commits.to_vec(),
            retry_count: order.retry,
            final_status: if success {
                WorkOrderStatus::Completed
            } else {
                order.status
            },
        }
    }

    fn persist_result(
        &self,
        result: &ImplementationResult,
    ) -> Result<(), crate::errors::ScratchpadError> {
        self.scratchpad.set(
            &Section::ImplementationResult(result.order_id.clone()),
            &self.project_id,
            result,
        )
    }

    fn checkpoint(
        &self,
        ctx: &RetryContext,
        step: WorkerStep,
        state: &StepState,
    ) -> Result<(), crate::errors::ScratchpadError> {
        let payload =
            serde_yaml::to_value(state).map_err(|e| crate::errors::ScratchpadError::Serialize {
                section: "checkpoint".into(),
                message: e.to_string(),
            })?;
        self.retry.save_checkpoint(ctx, step, 1, payload)
    }

    fn clear_checkpoint(&self, ctx: &RetryContext) {
        if let Err(e) = self
            .scratchpad
            .clear_checkpoint(&ctx.project_id, &ctx.task_id)
        {
            warn!(task = %ctx.task_id, "failed to clear checkpoint: {e}");
        }
    }
}

fn describe_verification_failure(outcome: &VerificationOutcome) -> String {
    let mut failed = Vec::new();
    if !outcome.tests_passed {
        failed.push("tests");
    }
    if !outcome.lint_passed {
        failed.push("lint");
    }
    if !outcome.build_passed {
        failed.push("build");
    }
    if !outcome.typecheck_passed {
        failed.push("typecheck");
    }
    failed.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::orders::ChangeKind;
    use crate::retry::RetryConfig;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    /// Scripted backend recording the steps it executed.
    #[derive(Default)]
    struct FakeBackend {
        steps: Mutex<Vec<String>>,
        verify_failures: AtomicU32,
        fix_progress: bool,
        branch_conflict: bool,
    }

    impl FakeBackend {
        fn passing() -> Self {
            Self {
                fix_progress: true,
                ..Default::default()
            }
        }

        fn failing_verification(failures: u32, fix_progress: bool) -> Self {
            Self {
                verify_failures: AtomicU32::new(failures),
                fix_progress,
                ..Default::default()
            }
        }

        fn record(&self, step: &str) {
            self.steps.lock().unwrap().push(step.to_string());
        }

        fn executed(&self) -> Vec<String> {
            self.steps.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WorkerBackend for FakeBackend {
        async fn analyze_context(
            &self,
            _order: &WorkOrder,
        ) -> Result<serde_yaml::Value, CategorizedError> {
            self.record("context_analysis");
            Ok(serde_yaml::Value::String("analyzed".into()))
        }

        async fn create_branch(&self, order: &WorkOrder) -> Result<String, CategorizedError> {
            self.record("branch_creation");
            if self.branch_conflict {
                return Err(CategorizedError::fatal(
                    "branch exists with unrelated commits",
                ));
            }
            Ok(format!("feat/{}", order.id.to_lowercase()))
        }

        async fn generate_code(
            &self,
            _order: &WorkOrder,
        ) -> Result<Vec<FileChange>, CategorizedError> {
            self.record("code_generation");
            Ok(vec![FileChange {
                path: "src/api.rs".into(),
                kind: ChangeKind::Added,
                lines_added: 120,
                lines_removed: 0,
            }])
        }

        async fn generate_tests(
            &self,
            _order: &WorkOrder,
        ) -> Result<Vec<String>, CategorizedError> {
            self.record("test_generation");
            Ok(vec!["tests/api_test.rs".into()])
        }

        async fn verify(
            &self,
            _order: &WorkOrder,
        ) -> Result<VerificationOutcome, CategorizedError> {
            self.record("verification");
            let remaining = self.verify_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.verify_failures.fetch_sub(1, Ordering::SeqCst);
                return Ok(VerificationOutcome {
                    tests_passed: false,
                    ..Default::default()
                });
            }
            Ok(VerificationOutcome {
                tests_passed: true,
                lint_passed: true,
                build_passed: true,
                typecheck_passed: true,
                coverage_percent: 87.0,
            })
        }

        async fn fix(&self, _order: &WorkOrder, _failure: &str) -> Result<bool, CategorizedError> {
            self.record("fix");
            Ok(self.fix_progress)
        }

        async fn commit(
            &self,
            _order: &WorkOrder,
            _branch: &str,
        ) -> Result<Vec<String>, CategorizedError> {
            self.record("commit");
            Ok(vec!["abc1234".into()])
        }
    }

    fn fast_retry() -> RetryLayer {
        RetryLayer::new(
            RetryConfig::default()
                .with_backoff(Duration::from_millis(1), Duration::from_millis(2))
                .with_timeout(Duration::from_secs(5)),
        )
    }

    fn worker_with(backend: Arc<FakeBackend>, pad: Scratchpad) -> Worker {
        Worker::new(
            "worker-1",
            "p1",
            backend,
            fast_retry().with_scratchpad(pad.clone()),
            pad,
        )
    }

    #[tokio::test]
    async fn happy_path_runs_all_steps_in_order() {
        let dir = tempdir().unwrap();
        let pad = Scratchpad::new(dir.path().join(".ad-sdlc"));
        let backend = Arc::new(FakeBackend::passing());
        let worker = worker_with(backend.clone(), pad.clone());

        let result = worker.run(WorkOrder::new("WO-001", "ISS-001", 150)).await;

        assert!(!result.escalated);
        assert_eq!(result.order.status, WorkOrderStatus::Completed);
        assert_eq!(
            backend.executed(),
            vec![
                "context_analysis",
                "branch_creation",
                "code_generation",
                "test_generation",
                "verification",
                "commit"
            ]
        );

        let impl_result = result.result.unwrap();
        assert_eq!(impl_result.branch, "feat/wo-001");
        assert_eq!(impl_result.commits, vec!["abc1234"]);
        assert!(impl_result.verification.all_passed());

        // Result file written exactly once at the published path.
        let path = pad.path_for(&Section::ImplementationResult("WO-001".into()), "p1");
        assert!(path.exists());
        // Checkpoint cleared on success.
        assert!(pad.restore_checkpoint("p1", "WO-001").unwrap().is_none());
    }

    #[tokio::test]
    async fn verification_retries_through_fixes_then_passes() {
        let dir = tempdir().unwrap();
        let pad = Scratchpad::new(dir.path().join(".ad-sdlc"));
        let backend = Arc::new(FakeBackend::failing_verification(2, true));
        let worker = worker_with(backend.clone(), pad);

        let result = worker.run(WorkOrder::new("WO-002", "ISS-002", 100)).await;

        assert!(!result.escalated);
        let steps = backend.executed();
        assert_eq!(steps.iter().filter(|s| *s == "verification").count(), 3);
        assert_eq!(steps.iter().filter(|s| *s == "fix").count(), 2);
    }

    #[tokio::test]
    async fn verification_escalates_when_fix_stalls() {
        let dir = tempdir().unwrap();
        let pad = Scratchpad::new(dir.path().join(".ad-sdlc"));
        let backend = Arc::new(FakeBackend::failing_verification(5, false));
        let worker = worker_with(backend.clone(), pad.clone());

        let result = worker.run(WorkOrder::new("WO-003", "ISS-003", 100)).await;

        assert!(result.escalated);
        assert_eq!(result.order.status, WorkOrderStatus::Failed);
        // One verification, one stalled fix, no commit.
        let steps = backend.executed();
        assert_eq!(steps.iter().filter(|s| *s == "verification").count(), 1);
        assert!(!steps.contains(&"commit".to_string()));

        // The terminal result is still persisted for diagnosis.
        let stored: crate::scratchpad::Stored<ImplementationResult> = pad
            .get_required(&Section::ImplementationResult("WO-003".into()), "p1")
            .unwrap();
        assert_eq!(stored.value.final_status, WorkOrderStatus::Failed);
    }

    #[tokio::test]
    async fn branch_conflict_is_fatal_and_blocks_the_order() {
        let dir = tempdir().unwrap();
        let pad = Scratchpad::new(dir.path().join(".ad-sdlc"));
        let backend = Arc::new(FakeBackend {
            branch_conflict: true,
            fix_progress: true,
            ..Default::default()
        });
        let worker = worker_with(backend.clone(), pad);

        let result = worker.run(WorkOrder::new("WO-004", "ISS-004", 100)).await;

        assert!(result.escalated);
        assert_eq!(result.order.status, WorkOrderStatus::Blocked);
        assert!(!backend.executed().contains(&"code_generation".to_string()));
    }

    #[tokio::test]
    async fn resume_skips_completed_resumable_steps() {
        let dir = tempdir().unwrap();
        let pad = Scratchpad::new(dir.path().join(".ad-sdlc"));

        // Simulate a crash mid code generation on a prior run: the
        // checkpoint sits at code_generation with context and branch done.
        let state = StepState {
            context: Some(serde_yaml::Value::String("analyzed".into())),
            branch: Some("feat/wo-005".into()),
            changes: vec![],
            test_artifacts: vec![],
        };
        let cp = crate::scratchpad::Checkpoint::new(
            "WO-005",
            WorkerStep::CodeGeneration,
            1,
            serde_yaml::to_value(&state).unwrap(),
        );
        pad.create_checkpoint("p1", &cp).unwrap();

        let backend = Arc::new(FakeBackend::passing());
        let worker = worker_with(backend.clone(), pad);
        let result = worker.run(WorkOrder::new("WO-005", "ISS-005", 100)).await;

        assert!(!result.escalated);
        let steps = backend.executed();
        // Resumes at code_generation, not context_analysis.
        assert_eq!(steps.first().map(String::as_str), Some("code_generation"));
        assert!(!steps.contains(&"context_analysis".to_string()));
        // The checkpointed branch is reused.
        assert_eq!(result.result.unwrap().branch, "feat/wo-005");
    }

    #[tokio::test]
    async fn interruption_during_verification_resumes_at_code_generation() {
        let dir = tempdir().unwrap();
        let pad = Scratchpad::new(dir.path().join(".ad-sdlc"));

        let state = StepState {
            context: Some(serde_yaml::Value::Null),
            branch: Some("feat/wo-006".into()),
            changes: vec![],
            test_artifacts: vec![],
        };
        let cp = crate::scratchpad::Checkpoint::new(
            "WO-006",
            WorkerStep::Verification,
            1,
            serde_yaml::to_value(&state).unwrap(),
        );
        pad.create_checkpoint("p1", &cp).unwrap();

        let backend = Arc::new(FakeBackend::passing());
        let worker = worker_with(backend.clone(), pad);
        worker.run(WorkOrder::new("WO-006", "ISS-006", 100)).await;

        let steps = backend.executed();
        assert_eq!(steps.first().map(String::as_str), Some("code_generation"));
    }
}
