//! Top-level pipeline execution.
//!
//! One orchestrator run walks the mode's stage list in topological order:
//! validates upstream artifacts for anything treated as pre-completed,
//! invokes each stage's agent under the retry layer, persists stage
//! results and lifecycle transitions through the scratchpad, and pauses
//! the session on fatal failure so `resume` can pick up where it stopped.
//! The implementation stage hands off to the worker-pool controller.

use crate::agent::{AgentInvoker, AgentRequest};
use crate::config::WorkflowConfig;
use crate::errors::PipelineError;
use crate::init;
use crate::model::{
    CollectedInfo, DependencyEdge, DependencyGraphDoc, IdAllocator, IdKind, Issue, IssueList,
    PipelineMode, Project,
};
use crate::pipeline::session::{Session, SessionStatus, StageRecord, StageStatus};
use crate::pipeline::stage::{ImpactScope, Stage, stages_for};
use crate::pool::{
    Controller, ControllerConfig, ControllerSummary, PrReviewer, QualityGates, ReviewBackend,
    WorkerBackend,
};
use crate::retry::{CategorizedError, RetryConfig, RetryContext, RetryLayer};
use crate::scratchpad::{
    ProjectState, Scratchpad, Section, TransitionTrigger, write_atomic,
};
use crate::validate;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

/// How a run relates to prior sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeMode {
    /// Ignore prior sessions.
    Fresh,
    /// Continue the named session.
    Resume(String),
    /// Treat every stage before the named one as pre-completed.
    StartFrom(String),
}

/// Where the initial request came from.
#[derive(Debug, Clone)]
pub enum RequestSource {
    File(PathBuf),
    Url(String),
    Text(String),
}

impl RequestSource {
    fn describe(&self) -> String {
        match self {
            Self::File(path) => format!("file:{}", path.display()),
            Self::Url(url) => format!("url:{url}"),
            Self::Text(_) => "text".to_string(),
        }
    }

    fn content(&self) -> Result<String, PipelineError> {
        match self {
            Self::Text(text) => Ok(text.clone()),
            Self::Url(url) => Ok(format!("Fetch and analyze the request at {url}")),
            Self::File(path) => std::fs::read_to_string(path).map_err(|e| {
                PipelineError::BadRequest(format!(
                    "cannot read request file {}: {e}",
                    path.display()
                ))
            }),
        }
    }
}

/// A start/resume request from the CLI.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub source: RequestSource,
    pub resume: ResumeMode,
    pub skip_approval: bool,
    /// Stages the user explicitly declares done, merged with what the
    /// prior session achieved and then filtered by the artifact validator.
    pub pre_completed: BTreeSet<String>,
}

impl StartRequest {
    pub fn text(text: &str) -> Self {
        Self {
            source: RequestSource::Text(text.to_string()),
            resume: ResumeMode::Fresh,
            skip_approval: false,
            pre_completed: BTreeSet::new(),
        }
    }

    pub fn with_skip_approval(mut self, skip: bool) -> Self {
        self.skip_approval = skip;
        self
    }

    pub fn with_resume(mut self, resume: ResumeMode) -> Self {
        self.resume = resume;
        self
    }
}

/// Human decision at an approval gate.
#[derive(Debug, Clone)]
pub enum ApprovalDecision {
    Approved { by: String },
    Rejected { by: String, reason: String },
}

/// Source of gate decisions. The CLI wires an interactive prompt; tests
/// and `--skip-approval` runs use [`AutoApprove`].
pub trait ApprovalGate: Send + Sync {
    fn review(&self, stage: &str, output: &str) -> ApprovalDecision;
}

/// Approves everything, attributed to the automation itself.
pub struct AutoApprove;

impl ApprovalGate for AutoApprove {
    fn review(&self, _stage: &str, _output: &str) -> ApprovalDecision {
        ApprovalDecision::Approved {
            by: "auto".to_string(),
        }
    }
}

/// Impact analysis payload parsed from the agent's output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ImpactReport {
    #[serde(default)]
    scope: ImpactScope,
    #[serde(default)]
    summary: String,
}

/// Issue-generation payload parsed from the agent's output.
#[derive(Debug, Deserialize)]
struct IssueGenerationOutput {
    issues: Vec<Issue>,
    #[serde(default)]
    edges: Vec<DependencyEdge>,
}

/// The top-level pipeline driver.
pub struct Orchestrator {
    project_dir: PathBuf,
    scratchpad: Scratchpad,
    config: WorkflowConfig,
    invoker: Arc<dyn AgentInvoker>,
    worker_backend: Arc<dyn WorkerBackend>,
    review_backend: Option<Arc<dyn ReviewBackend>>,
    approvals: Arc<dyn ApprovalGate>,
    retry: RetryLayer,
    pause_flag: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        project_dir: PathBuf,
        scratchpad: Scratchpad,
        config: WorkflowConfig,
        invoker: Arc<dyn AgentInvoker>,
        worker_backend: Arc<dyn WorkerBackend>,
    ) -> Self {
        let retry_config = RetryConfig::default()
            .with_max_attempts(config.retry.max_attempts)
            .with_backoff(
                Duration::from_secs(config.retry.base_delay_secs),
                Duration::from_secs(config.retry.max_delay_secs),
            )
            .with_timeout(Duration::from_secs(config.stage_timeout_secs));
        let retry = RetryLayer::new(retry_config)
            .with_scratchpad(scratchpad.clone())
            .with_escalation(Arc::new(|report| {
                error!(
                    task = %report.task_id,
                    category = %report.category,
                    "escalation: {}; next step: {}",
                    report.error,
                    report.recommendation
                );
            }));
        Self {
            project_dir,
            scratchpad,
            config,
            invoker,
            worker_backend,
            review_backend: None,
            approvals: Arc::new(AutoApprove),
            retry,
            pause_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_review_backend(mut self, backend: Arc<dyn ReviewBackend>) -> Self {
        self.review_backend = Some(backend);
        self
    }

    pub fn with_approvals(mut self, approvals: Arc<dyn ApprovalGate>) -> Self {
        self.approvals = approvals;
        self
    }

    /// Cooperative cancellation: setting the flag pauses the session at
    /// the next stage boundary; in-flight work runs to completion.
    pub fn pause_flag(&self) -> Arc<AtomicBool> {
        self.pause_flag.clone()
    }

    /// Run (or resume) a session for the project.
    pub async fn run(
        &self,
        project: &mut Project,
        request: &StartRequest,
    ) -> Result<Session, PipelineError> {
        self.scratchpad
            .set(&Section::Project, &project.id, project)?;

        let mut session = self.prepare_session(project, request)?;
        self.persist_session(&session)?;
        info!(
            session = %session.id,
            mode = %session.mode,
            pre_completed = session.pre_completed.len(),
            "session started"
        );

        let stages = stages_for(session.mode);
        let mut rejected_once: BTreeSet<String> = BTreeSet::new();
        let mut impact_scope = ImpactScope::default();

        let mut index = 0;
        while index < stages.len() {
            let stage = &stages[index];

            if self.pause_flag.load(Ordering::SeqCst) {
                info!(session = %session.id, "pause requested, stopping at stage boundary");
                session.status = SessionStatus::Paused;
                self.persist_session(&session)?;
                return Ok(session);
            }

            if session.stage_done(stage.name) {
                index += 1;
                continue;
            }

            let deps_met = stage
                .depends_on
                .iter()
                .all(|dep| session.stage_done(dep));
            if !deps_met {
                return Err(PipelineError::Invariant(format!(
                    "stage {} reached before its predecessors",
                    stage.name
                )));
            }

            if session.mode == PipelineMode::Enhancement && !impact_scope.runs(stage.name) {
                let mut record = StageRecord::started(stage.name, stage.role);
                record.finish(StageStatus::Skipped);
                info!(stage = stage.name, scope = ?impact_scope, "stage skipped by impact scope");
                session.record(record);
                self.persist_session(&session)?;
                index += 1;
                continue;
            }

            let mut record = StageRecord::started(stage.name, stage.role);
            match self.execute_stage(project, stage, request).await {
                Ok(output) => {
                    record.output = output.text;
                    record.artifacts = output.artifacts;
                    if stage.name == "impact_analysis" {
                        impact_scope = output.impact_scope.unwrap_or_default();
                    }
                }
                Err(err) => {
                    let category = err.category;
                    record.error = Some(err.message.clone());
                    record.finish(StageStatus::Failed);
                    session.record(record);
                    session.status = SessionStatus::Paused;
                    self.persist_session(&session)?;
                    error!(stage = stage.name, %category, "stage failed, session paused");
                    return Err(PipelineError::StageFailed {
                        stage: stage.name.to_string(),
                        category,
                        message: err.message,
                        recommendation: format!(
                            "inspect the stage output, then `ad-sdlc resume {}`",
                            session.id
                        ),
                        session_id: session.id.clone(),
                    });
                }
            }

            // Approval gate: the stage result awaits an explicit decision
            // before downstream stages may run.
            let approvals_on = !request.skip_approval && !self.config.skip_approval;
            if stage.approval_gate && approvals_on {
                record.status = StageStatus::PendingApproval;
                session.record(record.clone());
                self.persist_session(&session)?;

                match self.approvals.review(stage.name, &record.output) {
                    ApprovalDecision::Approved { by } => {
                        self.finish_stage(project, &mut session, stage, record, &by)?;
                        index += 1;
                    }
                    ApprovalDecision::Rejected { by, reason } => {
                        // The gate stage is demoted to not-completed; the
                        // rejection is audited on the transition log.
                        let mut rejected = session
                            .stages
                            .pop()
                            .expect("record pushed above");
                        rejected.error = Some(format!("rejected by {by}: {reason}"));
                        rejected.finish(StageStatus::Failed);
                        session.record(rejected);
                        self.scratchpad.admin_override(
                            &project.id,
                            project.state,
                            &format!("approval rejected for {}: {reason}", stage.name),
                            &by,
                        )?;
                        if !rejected_once.insert(stage.name.to_string()) {
                            warn!(stage = stage.name, "second rejection, pausing session");
                            session.status = SessionStatus::Paused;
                            self.persist_session(&session)?;
                            return Ok(session);
                        }
                        // Re-run the same stage.
                    }
                }
            } else {
                self.finish_stage(project, &mut session, stage, record, "orchestrator")?;
                index += 1;
            }
            self.persist_session(&session)?;
        }

        session.status = SessionStatus::Completed;
        self.persist_session(&session)?;
        info!(session = %session.id, "session completed");
        Ok(session)
    }

    fn prepare_session(
        &self,
        project: &Project,
        request: &StartRequest,
    ) -> Result<Session, PipelineError> {
        let mut session = match &request.resume {
            ResumeMode::Fresh => Session::new(&project.id, project.mode),
            ResumeMode::Resume(session_id) => {
                let parent: Session = self
                    .scratchpad
                    .get::<Session>(&Section::Session(session_id.clone()), &project.id)?
                    .map(|s| s.value)
                    .ok_or_else(|| PipelineError::SessionNotFound(session_id.clone()))?;
                Session::resumed_from(&parent)
            }
            ResumeMode::StartFrom(stage_name) => {
                let stages = stages_for(project.mode);
                let position = stages
                    .iter()
                    .position(|s| s.name == stage_name.as_str())
                    .ok_or_else(|| PipelineError::UnknownStage(stage_name.clone()))?;
                let mut session = Session::new(&project.id, project.mode);
                session.pre_completed = stages[..position]
                    .iter()
                    .map(|s| s.name.to_string())
                    .collect();
                session
            }
        };

        session.pre_completed.extend(request.pre_completed.clone());

        // Stages whose required artifacts vanished must re-run.
        let (retained, evicted) = validate::prune_pre_completed(
            self.scratchpad.root(),
            &project.id,
            project.mode,
            &session.pre_completed,
        );
        for report in &evicted {
            warn!(
                stage = %report.stage,
                missing = ?report.missing,
                "pre-completed stage re-queued"
            );
        }
        session.pre_completed = retained;
        Ok(session)
    }

    async fn execute_stage(
        &self,
        project: &Project,
        stage: &Stage,
        request: &StartRequest,
    ) -> Result<StageOutput, CategorizedError> {
        info!(stage = stage.name, role = stage.role, "stage started");
        match stage.name {
            "initialization" => {
                let result = init::init_project(&self.project_dir)
                    .map_err(|e| CategorizedError::fatal(e.to_string()))?;
                Ok(StageOutput::text("project scaffold ready").with_artifacts(vec![
                    result.root.join("config/workflow.yaml").display().to_string(),
                    result.root.join("config/agents.yaml").display().to_string(),
                ]))
            }
            "implementation" => self.run_implementation(project).await,
            _ => self.run_agent_stage(project, stage, request).await,
        }
    }

    async fn run_agent_stage(
        &self,
        project: &Project,
        stage: &Stage,
        request: &StartRequest,
    ) -> Result<StageOutput, CategorizedError> {
        let prompt = self.build_prompt(project, stage, request)?;
        let ctx = RetryContext::new(&project.id, stage.name, "orchestrator").with_service("agent");
        let invoker = self.invoker.clone();

        let outcome = self
            .retry
            .execute(&ctx, |_| {
                let request = AgentRequest::new(stage.role, &prompt);
                let invoker = invoker.clone();
                async move { invoker.invoke(&request).await }
            })
            .await;

        let agent_outcome = match outcome.data {
            Some(o) if o.success => o,
            Some(o) => {
                return Err(CategorizedError::recoverable(
                    o.error.unwrap_or_else(|| "agent reported failure".into()),
                ));
            }
            None => {
                return Err(outcome
                    .error
                    .unwrap_or_else(|| CategorizedError::fatal("agent produced no outcome")));
            }
        };

        self.persist_stage_artifacts(project, stage, &agent_outcome.output, &request.source.describe())
    }

    /// Write the artifacts a stage is contractually expected to leave on
    /// disk, returning their paths for the stage record.
    fn persist_stage_artifacts(
        &self,
        project: &Project,
        stage: &Stage,
        output: &str,
        source_label: &str,
    ) -> Result<StageOutput, CategorizedError> {
        let pad = &self.scratchpad;
        let pid = &project.id;
        let as_fatal = |e: crate::errors::ScratchpadError| CategorizedError::fatal(e.to_string());

        let mut result = StageOutput::text(output);
        match stage.name {
            "collection" => {
                let info = CollectedInfo {
                    project_id: pid.clone(),
                    source: source_label.to_string(),
                    raw_request: output.to_string(),
                    clarifications: Vec::new(),
                    collected_at: Utc::now(),
                };
                pad.set(&Section::CollectedInfo, pid, &info).map_err(as_fatal)?;
                result
                    .artifacts
                    .push(pad.path_for(&Section::CollectedInfo, pid).display().to_string());
            }
            "prd_generation" | "prd_update" => {
                pad.set_document(&Section::Prd, pid, output).map_err(as_fatal)?;
                result
                    .artifacts
                    .push(pad.path_for(&Section::Prd, pid).display().to_string());
            }
            "srs_generation" | "srs_update" => {
                pad.set_document(&Section::Srs, pid, output).map_err(as_fatal)?;
                result
                    .artifacts
                    .push(pad.path_for(&Section::Srs, pid).display().to_string());
            }
            "sds_generation" | "sds_update" => {
                pad.set_document(&Section::Sds, pid, output).map_err(as_fatal)?;
                result
                    .artifacts
                    .push(pad.path_for(&Section::Sds, pid).display().to_string());
            }
            "issue_generation" | "issue_import" => {
                let parsed: IssueGenerationOutput =
                    serde_json::from_str(output).map_err(|e| {
                        CategorizedError::recoverable(format!(
                            "issue output is not valid JSON: {e}"
                        ))
                    })?;
                let mut allocator = IdAllocator::default();
                for issue in &parsed.issues {
                    allocator.observe(IdKind::Issue, &issue.id);
                }
                let list = IssueList {
                    project_id: pid.clone(),
                    generated_at: Utc::now(),
                    issues: parsed.issues.clone(),
                    allocator,
                };
                pad.set(&Section::IssueList, pid, &list).map_err(as_fatal)?;
                let graph = DependencyGraphDoc {
                    project_id: pid.clone(),
                    nodes: parsed.issues,
                    edges: parsed.edges,
                };
                pad.set(&Section::DependencyGraph, pid, &graph).map_err(as_fatal)?;
                result.artifacts.extend([
                    pad.path_for(&Section::IssueList, pid).display().to_string(),
                    pad.path_for(&Section::DependencyGraph, pid).display().to_string(),
                ]);
            }
            "impact_analysis" => {
                let report: ImpactReport = serde_yaml::from_str(output).unwrap_or_else(|_| {
                    // Unparseable scope defaults to major: every document
                    // gets updated rather than silently skipped.
                    ImpactReport {
                        scope: ImpactScope::Major,
                        summary: output.to_string(),
                    }
                });
                let path = self.info_note_path(pid, "impact_analysis.yaml");
                let body = serde_yaml::to_string(&report)
                    .map_err(|e| CategorizedError::fatal(e.to_string()))?;
                write_atomic(&path, body.as_bytes()).map_err(as_fatal)?;
                result.artifacts.push(path.display().to_string());
                result.impact_scope = Some(report.scope);
            }
            "document_reading" | "codebase_analysis" | "code_reading" | "regression_testing" => {
                let file = match stage.name {
                    "document_reading" => "document_survey.yaml",
                    "codebase_analysis" => "codebase_analysis.yaml",
                    "code_reading" => "code_reading.yaml",
                    _ => "regression_baseline.yaml",
                };
                let path = self.info_note_path(pid, file);
                let note = serde_yaml::to_string(&StageNote {
                    stage: stage.name.to_string(),
                    generated_at: Utc::now(),
                    summary: output.to_string(),
                })
                .map_err(|e| CategorizedError::fatal(e.to_string()))?;
                write_atomic(&path, note.as_bytes()).map_err(as_fatal)?;
                result.artifacts.push(path.display().to_string());
            }
            _ => {}
        }
        Ok(result)
    }

    async fn run_implementation(
        &self,
        project: &Project,
    ) -> Result<StageOutput, CategorizedError> {
        let graph: DependencyGraphDoc = self
            .scratchpad
            .get_required::<DependencyGraphDoc>(&Section::DependencyGraph, &project.id)
            .map_err(|e| CategorizedError::fatal(e.to_string()))?
            .value;

        let controller_config = ControllerConfig::default()
            .with_capacity(self.config.max_workers);
        let mut controller = Controller::new(
            ControllerConfig {
                verification_retries: self.config.verification_retries,
                review_shares_pool: self.config.review_shares_pool,
                ..controller_config
            },
            &project.id,
            self.scratchpad.clone(),
            self.worker_backend.clone(),
            self.retry.clone(),
        );
        if let Some(review_backend) = &self.review_backend {
            controller = controller.with_reviewer(
                PrReviewer::new(review_backend.clone()).with_gates(QualityGates {
                    coverage_threshold: self.config.coverage_threshold,
                }),
            );
        }

        let summary = controller.run(&graph).await.map_err(|e| CategorizedError {
            category: e.category(),
            message: e.to_string(),
        })?;

        if summary.completed == 0 && !graph.nodes.is_empty() {
            return Err(CategorizedError::fatal(
                "no work order completed; every issue is blocked",
            ));
        }
        Ok(StageOutput::text(&summarize(&summary)))
    }

    fn finish_stage(
        &self,
        project: &mut Project,
        session: &mut Session,
        stage: &Stage,
        mut record: StageRecord,
        actor: &str,
    ) -> Result<(), PipelineError> {
        record.finish(StageStatus::Completed);
        // Replace the pending record when approval flowed through it.
        if session
            .stages
            .last()
            .is_some_and(|r| r.stage == stage.name && r.status == StageStatus::PendingApproval)
        {
            session.stages.pop();
        }
        session.record(record);

        if let Some(target) = stage.completes_to {
            self.advance_lifecycle(project, target, actor, stage.name)?;
        }
        info!(stage = stage.name, "stage completed");
        Ok(())
    }

    /// Walk the lifecycle forward one validated transition at a time until
    /// the target state is reached.
    fn advance_lifecycle(
        &self,
        project: &mut Project,
        target: ProjectState,
        actor: &str,
        stage_name: &str,
    ) -> Result<(), PipelineError> {
        // A re-run of an earlier stage (e.g. after artifact loss) must not
        // drag an already-advanced project backwards.
        if !project.state.precedes(target) {
            return Ok(());
        }
        while project.state != target {
            let next = project
                .state
                .forward_targets()
                .into_iter()
                .find(|s| *s != ProjectState::Cancelled)
                .ok_or_else(|| {
                    PipelineError::Invariant(format!(
                        "no forward path from {} to {target}",
                        project.state
                    ))
                })?;
            let record = self.scratchpad.transition(
                &project.id,
                next,
                TransitionTrigger::Normal,
                actor,
                &format!("stage {stage_name} completed"),
            )?;
            project.state = record.to;
            project.updated_at = record.timestamp;
        }
        Ok(())
    }

    fn build_prompt(
        &self,
        project: &Project,
        stage: &Stage,
        request: &StartRequest,
    ) -> Result<String, CategorizedError> {
        let mut sections = vec![format!(
            "Project: {} (mode: {}). Stage: {}.",
            project.name, project.mode, stage.name
        )];

        match stage.name {
            "collection" => {
                let content = request
                    .source
                    .content()
                    .map_err(|e| CategorizedError::fatal(e.to_string()))?;
                sections.push(format!("## REQUEST\n{content}"));
            }
            _ => {
                // Feed the upstream documents the stage depends on.
                for (section, label) in [
                    (Section::CollectedInfo, "COLLECTED INFO"),
                    (Section::Prd, "PRD"),
                    (Section::Srs, "SRS"),
                    (Section::Sds, "SDS"),
                ] {
                    let text = match section {
                        Section::CollectedInfo => self
                            .scratchpad
                            .get::<CollectedInfo>(&section, &project.id)
                            .ok()
                            .flatten()
                            .map(|s| s.value.raw_request),
                        _ => self
                            .scratchpad
                            .get_document(&section, &project.id)
                            .ok()
                            .flatten()
                            .map(|s| s.value),
                    };
                    if let Some(text) = text {
                        sections.push(format!("## {label}\n{text}"));
                    }
                }
            }
        }
        Ok(sections.join("\n\n"))
    }

    fn info_note_path(&self, project_id: &str, file: &str) -> PathBuf {
        self.scratchpad
            .root()
            .join(format!("scratchpad/info/{project_id}/{file}"))
    }

    fn persist_session(&self, session: &Session) -> Result<(), PipelineError> {
        self.scratchpad
            .set(
                &Section::Session(session.id.clone()),
                &session.project_id,
                session,
            )
            .map_err(Into::into)
    }
}

/// What a stage execution produced.
struct StageOutput {
    text: String,
    artifacts: Vec<String>,
    impact_scope: Option<ImpactScope>,
}

impl StageOutput {
    fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            artifacts: Vec::new(),
            impact_scope: None,
        }
    }

    fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }
}

/// Note file dropped by survey-style stages.
#[derive(Debug, Serialize, Deserialize)]
struct StageNote {
    stage: String,
    generated_at: chrono::DateTime<Utc>,
    summary: String,
}

fn summarize(summary: &ControllerSummary) -> String {
    format!(
        "implementation finished: {} completed, {} failed, {} blocked, {} merged",
        summary.completed, summary.failed, summary.blocked, summary.merged
    )
}
