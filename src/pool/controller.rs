//! Bounded-concurrency dispatch over the analyzed issue graph.
//!
//! The controller owns the single-tasked dispatch loop: it pops the
//! highest-scored ready issue, materialises a work order with a full
//! context snapshot, and hands it to a worker slot under the retry layer.
//! True parallelism is capped by a semaphore of the pool capacity. The
//! aggregated `controller_state.yaml` is rewritten on every status change
//! and on a 30-second heartbeat.

use crate::errors::PipelineError;
use crate::graph::{AnalyzerConfig, GraphAnalysis, IssueGraph};
use crate::model::{DependencyGraphDoc, IdKind, Issue, IssueStatus};
use crate::pool::orders::{ImplementationResult, WorkOrder, WorkOrderContext, WorkOrderStatus};
use crate::pool::review::{PrReviewer, ReviewDecision, ReviewRecord};
use crate::pool::worker::{Worker, WorkerBackend, WorkerRunResult};
use crate::retry::RetryLayer;
use crate::scratchpad::{Scratchpad, Section};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Default pool capacity.
pub const DEFAULT_CAPACITY: usize = 5;
/// Hard bounds on configurable capacity.
pub const CAPACITY_RANGE: std::ops::RangeInclusive<usize> = 1..=10;
/// Heartbeat interval for the aggregated state file.
pub const STATE_WRITE_INTERVAL: Duration = Duration::from_secs(30);
/// How many times a rejected or crashed issue may be re-queued.
const MAX_REQUEUES: u32 = 2;

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub capacity: usize,
    pub verification_retries: u32,
    pub quick_win_threshold: u32,
    /// Whether PR review consumes a pool slot (default: separate budget).
    pub review_shares_pool: bool,
    pub state_write_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            verification_retries: crate::pool::worker::DEFAULT_VERIFICATION_RETRIES,
            quick_win_threshold: AnalyzerConfig::default().quick_win_threshold,
            review_shares_pool: false,
            state_write_interval: STATE_WRITE_INTERVAL,
        }
    }
}

impl ControllerConfig {
    /// Clamp capacity into the supported range.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.clamp(*CAPACITY_RANGE.start(), *CAPACITY_RANGE.end());
        self
    }
}

/// Status of one worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    #[default]
    Idle,
    Working,
    Error,
}

/// Snapshot of a worker slot for monitoring output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: String,
    pub status: SlotStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_issue: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub tasks_completed: u32,
    pub failures: u32,
}

impl WorkerSnapshot {
    fn new(id: String) -> Self {
        Self {
            id,
            status: SlotStatus::Idle,
            current_issue: None,
            started_at: None,
            tasks_completed: 0,
            failures: 0,
        }
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.failures;
        if total == 0 {
            return 1.0;
        }
        f64::from(self.tasks_completed) / f64::from(total)
    }
}

/// Aggregated monitoring state (`controller_state.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerState {
    pub capacity: usize,
    pub updated_at: DateTime<Utc>,
    /// Work order counts keyed by status name.
    pub counts: BTreeMap<String, usize>,
    pub workers: Vec<WorkerSnapshot>,
    /// Highest-priority issues still waiting.
    pub ready_queue: Vec<String>,
    /// Human-readable bottleneck diagnoses.
    pub bottlenecks: Vec<String>,
}

/// Terminal summary of one controller run.
#[derive(Debug, Default)]
pub struct ControllerSummary {
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub merged: usize,
    pub results: Vec<ImplementationResult>,
    pub reviews: Vec<ReviewRecord>,
}

impl ControllerSummary {
    pub fn all_merged(&self) -> bool {
        self.failed == 0 && self.blocked == 0 && self.merged == self.completed
    }
}

/// The dispatcher. One instance drives one implementation stage.
pub struct Controller {
    config: ControllerConfig,
    project_id: String,
    scratchpad: Scratchpad,
    backend: Arc<dyn WorkerBackend>,
    retry: RetryLayer,
    reviewer: Option<PrReviewer>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        project_id: &str,
        scratchpad: Scratchpad,
        backend: Arc<dyn WorkerBackend>,
        retry: RetryLayer,
    ) -> Self {
        Self {
            config,
            project_id: project_id.to_string(),
            scratchpad,
            backend,
            retry,
            reviewer: None,
        }
    }

    pub fn with_reviewer(mut self, reviewer: PrReviewer) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    /// Dispatch the whole graph to completion (or exhaustion).
    pub async fn run(&self, doc: &DependencyGraphDoc) -> Result<ControllerSummary, PipelineError> {
        let graph = IssueGraph::build(doc.nodes.clone(), &doc.edges)?;
        let analyzer_config = AnalyzerConfig {
            quick_win_threshold: self.config.quick_win_threshold,
        };
        // A cycle is a fatal input error: nothing is dispatched.
        let analysis = graph.analyze(&analyzer_config)?;
        info!(
            issues = graph.len(),
            critical_path = ?analysis.critical_path,
            bottleneck = ?analysis.bottleneck,
            "dependency graph analyzed"
        );

        let mut run = RunState::reconstruct(&self.scratchpad, &self.project_id, doc)?;
        let mut slots: Vec<WorkerSnapshot> = (1..=self.config.capacity)
            .map(|n| WorkerSnapshot::new(format!("worker-{n}")))
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.config.capacity));
        let mut join_set: JoinSet<(String, WorkerRunResult)> = JoinSet::new();
        let mut heartbeat = tokio::time::interval(self.config.state_write_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut summary = ControllerSummary::default();

        loop {
            // Fill idle capacity from the ready queue. Dispatch decisions
            // happen only here, on the single controller task.
            loop {
                let busy: HashSet<String> =
                    run.in_flight.union(&run.halted).cloned().collect();
                let Some(issue_id) = analysis
                    .next_executable(&graph, &run.completed, &busy)
                    .map(str::to_string)
                else {
                    break;
                };
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    break;
                };
                let slot_id = {
                    let Some(slot) = slots.iter_mut().find(|s| s.status == SlotStatus::Idle)
                    else {
                        drop(permit);
                        break;
                    };
                    slot.status = SlotStatus::Working;
                    slot.current_issue = Some(issue_id.clone());
                    slot.started_at = Some(Utc::now());
                    slot.id.clone()
                };

                let issue = graph
                    .get(&issue_id)
                    .ok_or_else(|| {
                        PipelineError::Invariant(format!("ready issue {issue_id} not in graph"))
                    })?
                    .clone();
                let order =
                    self.materialise_order(&mut run, &graph, &analysis, &issue, &slot_id)?;
                run.in_flight.insert(issue_id.clone());

                let worker = Worker::new(
                    &slot_id,
                    &self.project_id,
                    self.backend.clone(),
                    self.retry.clone(),
                    self.scratchpad.clone(),
                )
                .with_verification_retries(self.config.verification_retries);
                let task_slot = slot_id.clone();
                join_set.spawn(async move {
                    let result = worker.run(order).await;
                    drop(permit);
                    (task_slot, result)
                });

                self.write_state(&run, &slots, &analysis)?;
            }

            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                joined = join_set.join_next() => {
                    let Some(joined) = joined else { continue };
                    match joined {
                        Ok((slot_id, run_result)) => {
                            self.handle_finished(
                                &mut run,
                                &mut slots,
                                &slot_id,
                                run_result,
                                &mut summary,
                                &semaphore,
                            )
                            .await?;
                        }
                        Err(e) => {
                            warn!("worker task panicked: {e}");
                        }
                    }
                    self.write_state(&run, &slots, &analysis)?;
                }
                _ = heartbeat.tick() => {
                    self.write_state(&run, &slots, &analysis)?;
                }
            }
        }

        self.write_state(&run, &slots, &analysis)?;
        summary.completed = run.completed.len();
        Ok(summary)
    }

    /// Allocate the next `WO-NNN` and snapshot dispatch context.
    fn materialise_order(
        &self,
        run: &mut RunState,
        graph: &IssueGraph,
        analysis: &GraphAnalysis,
        issue: &Issue,
        slot_id: &str,
    ) -> Result<WorkOrder, PipelineError> {
        let id = IdKind::WorkOrder.format(run.next_order_number);
        run.next_order_number += 1;

        let dependency_status: BTreeMap<String, IssueStatus> = graph
            .dependencies(&issue.id)
            .into_iter()
            .map(|dep| {
                let status = if run.completed.contains(dep) {
                    IssueStatus::Completed
                } else {
                    IssueStatus::Ready
                };
                (dep.to_string(), status)
            })
            .collect();

        let score = analysis
            .scores
            .get(&issue.id)
            .map(|s| s.score)
            .unwrap_or_default();
        let retry = run.requeue_counts.get(&issue.id).copied().unwrap_or(0);

        let mut order = WorkOrder::new(&id, &issue.id, score)
            .with_context(WorkOrderContext {
                component_id: issue.component_id.clone(),
                feature_id: issue.feature_id.clone(),
                requirement_id: issue.requirement_id.clone(),
                related_files: issue.related_files.clone(),
                dependency_status,
            })
            .with_acceptance_criteria(issue.acceptance_criteria.clone())
            .with_retry(retry);
        order.assign(slot_id);

        self.scratchpad
            .set(&Section::WorkOrder(order.id.clone()), &self.project_id, &order)?;
        info!(order = %order.id, issue = %issue.id, score, "work order dispatched");
        Ok(order)
    }

    async fn handle_finished(
        &self,
        run: &mut RunState,
        slots: &mut [WorkerSnapshot],
        slot_id: &str,
        run_result: WorkerRunResult,
        summary: &mut ControllerSummary,
        semaphore: &Arc<Semaphore>,
    ) -> Result<(), PipelineError> {
        let issue_id = run_result.order.issue_id.clone();
        run.in_flight.remove(&issue_id);

        let slot = slots
            .iter_mut()
            .find(|s| s.id == slot_id)
            .ok_or_else(|| PipelineError::Invariant(format!("unknown slot {slot_id}")))?;
        slot.current_issue = None;
        slot.started_at = None;

        // Persist the terminal order state alongside the result.
        self.scratchpad.set(
            &Section::WorkOrder(run_result.order.id.clone()),
            &self.project_id,
            &run_result.order,
        )?;

        if run_result.escalated {
            slot.failures += 1;
            // Fatal workers reset to idle after escalation; the order stays
            // terminal and its dependents stay queued.
            slot.status = SlotStatus::Idle;
            *run.failure_counts.entry(issue_id.clone()).or_insert(0) += 1;
            match run_result.order.status {
                WorkOrderStatus::Failed => summary.failed += 1,
                _ => summary.blocked += 1,
            }
            run.halted.insert(issue_id.clone());
            run.statuses.insert(issue_id, IssueStatus::Blocked);
            return Ok(());
        }

        slot.status = SlotStatus::Idle;
        slot.tasks_completed += 1;

        let Some(result) = run_result.result else {
            return Err(PipelineError::Invariant(format!(
                "worker for {issue_id} finished without a result"
            )));
        };

        match self.review_result(&result, semaphore).await? {
            Some(record) if record.decision != ReviewDecision::Merge => {
                // Quality gates failed: the issue goes back to the ready
                // queue as a fresh work order, bounded by the re-queue cap.
                let requeues = run.requeue_counts.entry(issue_id.clone()).or_insert(0);
                *requeues += 1;
                if *requeues > MAX_REQUEUES {
                    warn!(issue = %issue_id, "re-queue budget exhausted, blocking issue");
                    run.halted.insert(issue_id.clone());
                    run.statuses.insert(issue_id, IssueStatus::Blocked);
                    summary.blocked += 1;
                } else {
                    info!(
                        issue = %issue_id,
                        decision = ?record.decision,
                        retry = *requeues,
                        "review gates failed, re-queueing issue"
                    );
                    run.statuses.insert(issue_id, IssueStatus::Ready);
                }
                summary.reviews.push(record);
            }
            Some(record) => {
                summary.merged += 1;
                summary.reviews.push(record);
                run.completed.insert(issue_id.clone());
                run.statuses.insert(issue_id, IssueStatus::Completed);
                summary.results.push(result);
            }
            None => {
                run.completed.insert(issue_id.clone());
                run.statuses.insert(issue_id, IssueStatus::Completed);
                summary.results.push(result);
            }
        }
        Ok(())
    }

    /// Run the PR reviewer over a completed result, persisting the record.
    ///
    /// With `review_shares_pool` set, the review occupies a pool slot for
    /// its duration; a permit is always obtainable here because the worker
    /// that produced `result` released its own before finishing.
    async fn review_result(
        &self,
        result: &ImplementationResult,
        semaphore: &Arc<Semaphore>,
    ) -> Result<Option<ReviewRecord>, PipelineError> {
        let Some(reviewer) = &self.reviewer else {
            return Ok(None);
        };
        let _permit = if self.config.review_shares_pool {
            Some(semaphore.clone().acquire_owned().await.map_err(|e| {
                PipelineError::Invariant(format!("worker pool semaphore closed: {e}"))
            })?)
        } else {
            None
        };
        let record = reviewer
            .review(result)
            .await
            .map_err(|e| PipelineError::Other(anyhow::anyhow!("review failed: {e}")))?;
        self.scratchpad.set(
            &Section::Review(record.pr_id.clone()),
            &self.project_id,
            &record,
        )?;
        Ok(Some(record))
    }

    fn write_state(
        &self,
        run: &RunState,
        slots: &[WorkerSnapshot],
        analysis: &GraphAnalysis,
    ) -> Result<(), PipelineError> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for status in run.statuses.values() {
            let key = match status {
                IssueStatus::Ready => "ready",
                IssueStatus::InProgress => "in_progress",
                IssueStatus::Completed => "completed",
                IssueStatus::Blocked => "blocked",
            };
            *counts.entry(key.to_string()).or_insert(0) += 1;
        }

        let ready_queue: Vec<String> = analysis
            .order
            .iter()
            .filter(|id| {
                !run.completed.contains(*id)
                    && !run.in_flight.contains(*id)
                    && !run.halted.contains(*id)
            })
            .take(5)
            .cloned()
            .collect();

        let mut bottlenecks = Vec::new();
        if analysis.critical_path.len() > 3 {
            bottlenecks.push(format!(
                "dependency chain of {} issues on the critical path",
                analysis.critical_path.len()
            ));
        }
        if let Some(node) = &analysis.bottleneck {
            bottlenecks.push(format!("highest-effort task on the critical path: {node}"));
        }
        for (issue, failures) in &run.failure_counts {
            if *failures >= 2 {
                bottlenecks.push(format!("{issue} has failed {failures} times"));
            }
        }

        let state = ControllerState {
            capacity: self.config.capacity,
            updated_at: Utc::now(),
            counts,
            workers: slots.to_vec(),
            ready_queue,
            bottlenecks,
        };
        self.scratchpad
            .set(&Section::ControllerState, &self.project_id, &state)?;
        Ok(())
    }
}

/// In-memory dispatch state, reconstructed from the work-orders directory
/// on resume.
struct RunState {
    completed: HashSet<String>,
    in_flight: HashSet<String>,
    /// Issues that reached a terminal failure this run; never re-dispatched.
    halted: HashSet<String>,
    statuses: BTreeMap<String, IssueStatus>,
    requeue_counts: BTreeMap<String, u32>,
    failure_counts: BTreeMap<String, u32>,
    next_order_number: u32,
}

impl RunState {
    fn reconstruct(
        pad: &Scratchpad,
        project_id: &str,
        doc: &DependencyGraphDoc,
    ) -> Result<Self, PipelineError> {
        let mut completed = HashSet::new();
        let mut halted = HashSet::new();
        let mut statuses = BTreeMap::new();
        let mut requeue_counts = BTreeMap::new();
        let mut highest_order = 0u32;

        for node in &doc.nodes {
            statuses.insert(node.id.clone(), node.status);
            if node.status == IssueStatus::Completed {
                completed.insert(node.id.clone());
            }
        }

        let orders_dir = pad
            .root()
            .join(format!("scratchpad/progress/{project_id}/work_orders"));
        if orders_dir.exists() {
            for entry in std::fs::read_dir(&orders_dir)
                .map_err(|e| PipelineError::Other(anyhow::anyhow!("listing work orders: {e}")))?
            {
                let Ok(entry) = entry else { continue };
                let Some(order_id) = entry
                    .file_name()
                    .to_string_lossy()
                    .strip_suffix(".yaml")
                    .map(str::to_string)
                else {
                    continue;
                };
                if let Some(n) = IdKind::WorkOrder.number(&order_id) {
                    highest_order = highest_order.max(n);
                }
                let Some(stored) =
                    pad.get::<WorkOrder>(&Section::WorkOrder(order_id.clone()), project_id)?
                else {
                    continue;
                };
                let order = stored.value;
                match order.status {
                    WorkOrderStatus::Completed => {
                        completed.insert(order.issue_id.clone());
                        statuses.insert(order.issue_id, IssueStatus::Completed);
                    }
                    WorkOrderStatus::Blocked | WorkOrderStatus::Failed => {
                        // Terminal but unfinished; the issue may be
                        // re-queued by review feedback, keep its count.
                        requeue_counts.insert(order.issue_id.clone(), order.retry);
                    }
                    _ => {
                        // A non-terminal order from a crashed run: eligible
                        // for one reassignment.
                        let count = requeue_counts.entry(order.issue_id.clone()).or_insert(0);
                        *count = (*count).max(order.retry + 1);
                        if order.retry + 1 > MAX_REQUEUES {
                            halted.insert(order.issue_id.clone());
                            statuses.insert(order.issue_id, IssueStatus::Blocked);
                        }
                    }
                }
            }
        }

        Ok(Self {
            completed,
            in_flight: HashSet::new(),
            halted,
            statuses,
            requeue_counts,
            failure_counts: BTreeMap::new(),
            next_order_number: highest_order + 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DependencyEdge, Priority};
    use crate::pool::orders::{FileChange, VerificationOutcome};
    use crate::pool::review::ReviewBackend;
    use crate::pool::worker::WorkerBackend;
    use crate::retry::{CategorizedError, RetryConfig};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn issue(id: &str, deps_effort: u32) -> Issue {
        Issue {
            id: id.to_string(),
            title: format!("Issue {id}"),
            priority: Priority::P1,
            effort: deps_effort,
            status: IssueStatus::Ready,
            component_id: Some("CMP-001".into()),
            feature_id: Some("SF-001".into()),
            requirement_id: Some("FR-001".into()),
            related_files: vec!["src/api.rs".into()],
            acceptance_criteria: vec!["works".into()],
        }
    }

    fn doc(nodes: Vec<Issue>, edges: Vec<DependencyEdge>) -> DependencyGraphDoc {
        DependencyGraphDoc {
            project_id: "p1".into(),
            nodes,
            edges,
        }
    }

    /// Backend that succeeds instantly and tracks peak concurrency.
    struct CountingBackend {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl CountingBackend {
        fn new() -> Self {
            Self {
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn enter(&self) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl WorkerBackend for CountingBackend {
        async fn analyze_context(
            &self,
            _order: &WorkOrder,
        ) -> Result<serde_yaml::Value, CategorizedError> {
            self.enter();
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(serde_yaml::Value::Null)
        }

        async fn create_branch(&self, order: &WorkOrder) -> Result<String, CategorizedError> {
            Ok(format!("feat/{}", order.id.to_lowercase()))
        }

        async fn generate_code(
            &self,
            _order: &WorkOrder,
        ) -> Result<Vec<FileChange>, CategorizedError> {
            Ok(vec![])
        }

        async fn generate_tests(
            &self,
            _order: &WorkOrder,
        ) -> Result<Vec<String>, CategorizedError> {
            Ok(vec![])
        }

        async fn verify(
            &self,
            _order: &WorkOrder,
        ) -> Result<VerificationOutcome, CategorizedError> {
            Ok(VerificationOutcome {
                tests_passed: true,
                lint_passed: true,
                build_passed: true,
                typecheck_passed: true,
                coverage_percent: 90.0,
            })
        }

        async fn fix(&self, _order: &WorkOrder, _f: &str) -> Result<bool, CategorizedError> {
            Ok(true)
        }

        async fn commit(
            &self,
            _order: &WorkOrder,
            _branch: &str,
        ) -> Result<Vec<String>, CategorizedError> {
            self.exit();
            Ok(vec!["abc1234".into()])
        }
    }

    fn fast_retry(pad: &Scratchpad) -> RetryLayer {
        RetryLayer::new(
            RetryConfig::default()
                .with_backoff(Duration::from_millis(1), Duration::from_millis(2))
                .with_timeout(Duration::from_secs(10)),
        )
        .with_scratchpad(pad.clone())
    }

    #[tokio::test]
    async fn dispatches_whole_graph_in_dependency_order() {
        let dir = tempdir().unwrap();
        let pad = Scratchpad::new(dir.path().join(".ad-sdlc"));
        let backend = Arc::new(CountingBackend::new());
        let controller = Controller::new(
            ControllerConfig::default(),
            "p1",
            pad.clone(),
            backend,
            fast_retry(&pad),
        );

        let summary = controller
            .run(&doc(
                vec![issue("ISS-001", 2), issue("ISS-002", 3), issue("ISS-003", 1)],
                vec![
                    DependencyEdge {
                        from: "ISS-001".into(),
                        to: "ISS-002".into(),
                    },
                    DependencyEdge {
                        from: "ISS-002".into(),
                        to: "ISS-003".into(),
                    },
                ],
            ))
            .await
            .unwrap();

        assert_eq!(summary.completed, 3);
        assert_eq!(summary.failed, 0);
        // Orders were persisted with monotonically allocated ids.
        for n in 1..=3 {
            let path = pad.path_for(
                &Section::WorkOrder(IdKind::WorkOrder.format(n)),
                "p1",
            );
            assert!(path.exists(), "missing WO-{n:03}");
        }
        // Monitoring state was written.
        let state: crate::scratchpad::Stored<ControllerState> =
            pad.get_required(&Section::ControllerState, "p1").unwrap();
        assert_eq!(state.value.capacity, DEFAULT_CAPACITY);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_capacity() {
        let dir = tempdir().unwrap();
        let pad = Scratchpad::new(dir.path().join(".ad-sdlc"));
        let backend = Arc::new(CountingBackend::new());
        let controller = Controller::new(
            ControllerConfig::default().with_capacity(2),
            "p1",
            pad.clone(),
            backend.clone(),
            fast_retry(&pad),
        );

        // Six independent issues all ready at once.
        let nodes = (1..=6).map(|n| issue(&format!("ISS-{n:03}"), 1)).collect();
        let summary = controller.run(&doc(nodes, vec![])).await.unwrap();

        assert_eq!(summary.completed, 6);
        assert!(
            backend.peak.load(Ordering::SeqCst) <= 2,
            "peak concurrency {} exceeded capacity 2",
            backend.peak.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn cycle_dispatches_nothing() {
        let dir = tempdir().unwrap();
        let pad = Scratchpad::new(dir.path().join(".ad-sdlc"));
        let controller = Controller::new(
            ControllerConfig::default(),
            "p1",
            pad.clone(),
            Arc::new(CountingBackend::new()),
            fast_retry(&pad),
        );

        let result = controller
            .run(&doc(
                vec![issue("A", 1), issue("B", 1), issue("C", 1)],
                vec![
                    DependencyEdge {
                        from: "A".into(),
                        to: "B".into(),
                    },
                    DependencyEdge {
                        from: "B".into(),
                        to: "C".into(),
                    },
                    DependencyEdge {
                        from: "C".into(),
                        to: "A".into(),
                    },
                ],
            ))
            .await;

        match result {
            Err(PipelineError::Analyzer(
                crate::errors::AnalyzerError::CircularDependency { cycle },
            )) => {
                assert_eq!(cycle, vec!["A", "B", "C", "A"]);
            }
            other => panic!("expected circular dependency, got {other:?}"),
        }
        // No work order files were created.
        let orders_dir = pad.root().join("scratchpad/progress/p1/work_orders");
        assert!(!orders_dir.exists());
    }

    #[tokio::test]
    async fn capacity_is_clamped_to_the_supported_range() {
        let config = ControllerConfig::default().with_capacity(50);
        assert_eq!(config.capacity, 10);
        let config = ControllerConfig::default().with_capacity(0);
        assert_eq!(config.capacity, 1);
    }

    /// Review backend whose security scan always passes and that counts
    /// merges.
    struct AcceptingReviewBackend;

    #[async_trait]
    impl ReviewBackend for AcceptingReviewBackend {
        async fn open_pr(
            &self,
            result: &ImplementationResult,
        ) -> Result<String, CategorizedError> {
            Ok(format!("PR-{}", &result.order_id[3..]))
        }
        async fn security_scan(
            &self,
            _result: &ImplementationResult,
        ) -> Result<bool, CategorizedError> {
            Ok(true)
        }
        async fn merge(&self, _pr_id: &str) -> Result<(), CategorizedError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn merged_reviews_count_toward_summary() {
        let dir = tempdir().unwrap();
        let pad = Scratchpad::new(dir.path().join(".ad-sdlc"));
        let controller = Controller::new(
            ControllerConfig::default(),
            "p1",
            pad.clone(),
            Arc::new(CountingBackend::new()),
            fast_retry(&pad),
        )
        .with_reviewer(PrReviewer::new(Arc::new(AcceptingReviewBackend)));

        let summary = controller
            .run(&doc(vec![issue("ISS-001", 1)], vec![]))
            .await
            .unwrap();

        assert_eq!(summary.merged, 1);
        assert!(summary.all_merged());
        // The review record landed at the published path.
        let path = pad.path_for(&Section::Review("PR-001".into()), "p1");
        assert!(path.exists());
    }

    #[tokio::test]
    async fn shared_pool_reviews_take_a_slot_and_still_drain() {
        let dir = tempdir().unwrap();
        let pad = Scratchpad::new(dir.path().join(".ad-sdlc"));
        let backend = Arc::new(CountingBackend::new());
        let controller = Controller::new(
            ControllerConfig {
                review_shares_pool: true,
                ..ControllerConfig::default().with_capacity(1)
            },
            "p1",
            pad.clone(),
            backend,
            fast_retry(&pad),
        )
        .with_reviewer(PrReviewer::new(Arc::new(AcceptingReviewBackend)));

        let nodes = vec![issue("ISS-001", 1), issue("ISS-002", 1)];
        let summary = controller.run(&doc(nodes, vec![])).await.unwrap();

        // Each review borrowed the single slot and returned it, so both
        // issues completed and merged.
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.merged, 2);
    }

    /// Worker backend that fails verification with coverage below the gate
    /// the first time an issue is attempted, then passes.
    struct FlakyCoverageBackend {
        attempts: Mutex<BTreeMap<String, u32>>,
    }

    #[async_trait]
    impl WorkerBackend for FlakyCoverageBackend {
        async fn analyze_context(
            &self,
            _order: &WorkOrder,
        ) -> Result<serde_yaml::Value, CategorizedError> {
            Ok(serde_yaml::Value::Null)
        }
        async fn create_branch(&self, order: &WorkOrder) -> Result<String, CategorizedError> {
            Ok(format!("feat/{}", order.id.to_lowercase()))
        }
        async fn generate_code(
            &self,
            _order: &WorkOrder,
        ) -> Result<Vec<FileChange>, CategorizedError> {
            Ok(vec![])
        }
        async fn generate_tests(
            &self,
            _order: &WorkOrder,
        ) -> Result<Vec<String>, CategorizedError> {
            Ok(vec![])
        }
        async fn verify(
            &self,
            order: &WorkOrder,
        ) -> Result<VerificationOutcome, CategorizedError> {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(order.issue_id.clone()).or_insert(0);
            *n += 1;
            let coverage = if *n == 1 { 72.0 } else { 85.0 };
            Ok(VerificationOutcome {
                tests_passed: true,
                lint_passed: true,
                build_passed: true,
                typecheck_passed: true,
                coverage_percent: coverage,
            })
        }
        async fn fix(&self, _order: &WorkOrder, _f: &str) -> Result<bool, CategorizedError> {
            Ok(true)
        }
        async fn commit(
            &self,
            _order: &WorkOrder,
            _branch: &str,
        ) -> Result<Vec<String>, CategorizedError> {
            Ok(vec!["abc1234".into()])
        }
    }

    #[tokio::test]
    async fn low_coverage_requeues_until_the_gate_passes() {
        let dir = tempdir().unwrap();
        let pad = Scratchpad::new(dir.path().join(".ad-sdlc"));
        let controller = Controller::new(
            ControllerConfig::default(),
            "p1",
            pad.clone(),
            Arc::new(FlakyCoverageBackend {
                attempts: Mutex::new(BTreeMap::new()),
            }),
            fast_retry(&pad),
        )
        .with_reviewer(PrReviewer::new(Arc::new(AcceptingReviewBackend)));

        let summary = controller
            .run(&doc(vec![issue("ISS-001", 1)], vec![]))
            .await
            .unwrap();

        // First attempt: coverage 72% → changes requested → re-queued.
        // Second attempt: coverage 85% → merged.
        assert_eq!(summary.merged, 1);
        assert_eq!(summary.reviews.len(), 2);
        assert_eq!(summary.reviews[0].decision, ReviewDecision::RequestChanges);
        assert_eq!(summary.reviews[1].decision, ReviewDecision::Merge);
        // The second work order carries retry = 1.
        let second: crate::scratchpad::Stored<WorkOrder> = pad
            .get_required(&Section::WorkOrder("WO-002".into()), "p1")
            .unwrap();
        assert_eq!(second.value.retry, 1);
    }
}
