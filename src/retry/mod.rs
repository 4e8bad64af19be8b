//! Retry and recovery layer.
//!
//! Wraps any async operation with a per-attempt timeout, categorised
//! retry, and escalation. Transient errors back off exponentially with
//! full jitter; recoverable errors retry only after a caller-supplied
//! fixer reports progress; fatal errors escalate immediately. Transport
//! retry here is orthogonal to the verification retry inside a worker
//! step, and the two budgets are never multiplied.

mod breaker;
mod escalation;

pub use breaker::CircuitBreaker;
pub use escalation::{AttemptLog, EscalationReport};

use crate::errors::ErrorCategory;
use crate::scratchpad::{Checkpoint, Scratchpad, WorkerStep};
use chrono::Utc;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default cap on attempts per operation.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default base delay for exponential backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5);
/// Default backoff ceiling.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
/// Default per-attempt timeout.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(600);

/// A failure tagged with its retry category.
#[derive(Debug, Clone)]
pub struct CategorizedError {
    pub category: ErrorCategory,
    pub message: String,
}

impl CategorizedError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Transient,
            message: message.into(),
        }
    }

    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Recoverable,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Fatal,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CategorizedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.category)
    }
}

/// Retry tuning for one operation class.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Per-attempt timeout; a timeout is categorised transient unless the
    /// operation is marked non-retryable.
    pub timeout: Duration,
    pub non_retryable: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            timeout: DEFAULT_ATTEMPT_TIMEOUT,
            non_retryable: false,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = cap;
        self
    }

    pub fn non_retryable(mut self) -> Self {
        self.non_retryable = true;
        self
    }

    /// Exponential delay for an attempt, capped, with full jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);
        let jittered = rand::thread_rng().gen_range(0..=exp.as_millis() as u64);
        Duration::from_millis(jittered)
    }
}

/// Identifies the work an operation belongs to.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub project_id: String,
    pub task_id: String,
    pub worker_id: String,
    /// Breaker key for the external service this operation calls.
    pub service_key: Option<String>,
}

impl RetryContext {
    pub fn new(project_id: &str, task_id: &str, worker_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
            service_key: None,
        }
    }

    pub fn with_service(mut self, key: &str) -> Self {
        self.service_key = Some(key.to_string());
        self
    }
}

/// Result of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub success: bool,
    pub data: Option<T>,
    pub attempts: u32,
    pub duration: Duration,
    pub error: Option<CategorizedError>,
}

type EscalationSink = Arc<dyn Fn(EscalationReport) + Send + Sync>;

/// The retry engine. Cheap to clone per subsystem.
#[derive(Clone)]
pub struct RetryLayer {
    config: RetryConfig,
    breaker: Arc<CircuitBreaker>,
    scratchpad: Option<Scratchpad>,
    escalation: Option<EscalationSink>,
}

impl RetryLayer {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            breaker: Arc::new(CircuitBreaker::default()),
            scratchpad: None,
            escalation: None,
        }
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    /// Attach the scratchpad so checkpoints clear on success and progress
    /// snapshots reach escalation reports.
    pub fn with_scratchpad(mut self, pad: Scratchpad) -> Self {
        self.scratchpad = Some(pad);
        self
    }

    pub fn with_escalation(mut self, sink: EscalationSink) -> Self {
        self.escalation = Some(sink);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Persist a step checkpoint for the context's work order.
    pub fn save_checkpoint(
        &self,
        ctx: &RetryContext,
        step: WorkerStep,
        attempt: u32,
        state: serde_yaml::Value,
    ) -> Result<(), crate::errors::ScratchpadError> {
        let Some(pad) = &self.scratchpad else {
            return Ok(());
        };
        let cp = Checkpoint::new(&ctx.task_id, step, attempt, state);
        pad.create_checkpoint(&ctx.project_id, &cp)
    }

    /// Load the resumable checkpoint for the context, if any. The caller
    /// decides the resume step via `Checkpoint::step.resume_step()`.
    pub fn load_checkpoint(
        &self,
        ctx: &RetryContext,
    ) -> Result<Option<Checkpoint>, crate::errors::ScratchpadError> {
        match &self.scratchpad {
            Some(pad) => pad.restore_checkpoint(&ctx.project_id, &ctx.task_id),
            None => Ok(None),
        }
    }

    /// Run `op` with retry but no fix step: recoverable errors escalate
    /// after the first failure.
    pub async fn execute<T, F, Fut>(&self, ctx: &RetryContext, op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CategorizedError>>,
    {
        self.execute_with_fixer(ctx, op, |_| async { false }).await
    }

    /// Run `op` under the full policy. `fixer` is invoked before retrying
    /// a recoverable failure and must report whether it made progress.
    pub async fn execute_with_fixer<T, F, Fut, Fix, FixFut>(
        &self,
        ctx: &RetryContext,
        mut op: F,
        mut fixer: Fix,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CategorizedError>>,
        Fix: FnMut(&CategorizedError) -> FixFut,
        FixFut: Future<Output = bool>,
    {
        let started = Instant::now();
        let mut attempts = Vec::new();

        for attempt in 1..=self.config.max_attempts {
            if let Some(key) = &ctx.service_key
                && !self.breaker.allow(key)
            {
                let err = CategorizedError::transient(format!("circuit open for '{key}'"));
                attempts.push(self.log_attempt(attempt, Duration::ZERO, &err));
                if attempt < self.config.max_attempts {
                    tokio::time::sleep(self.config.backoff_delay(attempt)).await;
                    continue;
                }
                return self.escalate(ctx, attempts, err, started).await;
            }

            let attempt_started = Instant::now();
            let result = match tokio::time::timeout(self.config.timeout, op(attempt)).await {
                Ok(r) => r,
                Err(_) => Err(CategorizedError {
                    category: if self.config.non_retryable {
                        ErrorCategory::Fatal
                    } else {
                        ErrorCategory::Transient
                    },
                    message: format!(
                        "attempt timed out after {}s",
                        self.config.timeout.as_secs()
                    ),
                }),
            };
            let elapsed = attempt_started.elapsed();

            match result {
                Ok(data) => {
                    if let Some(key) = &ctx.service_key {
                        self.breaker.record_success(key);
                    }
                    self.clear_checkpoint(ctx);
                    return RetryOutcome {
                        success: true,
                        data: Some(data),
                        attempts: attempt,
                        duration: started.elapsed(),
                        error: None,
                    };
                }
                Err(err) => {
                    if let Some(key) = &ctx.service_key {
                        self.breaker.record_failure(key);
                    }
                    debug!(
                        task = %ctx.task_id,
                        attempt,
                        category = %err.category,
                        "attempt failed: {}",
                        err.message
                    );
                    attempts.push(self.log_attempt(attempt, elapsed, &err));

                    let out_of_attempts = attempt >= self.config.max_attempts;
                    match err.category {
                        ErrorCategory::Transient if !out_of_attempts => {
                            tokio::time::sleep(self.config.backoff_delay(attempt)).await;
                        }
                        ErrorCategory::Recoverable if !out_of_attempts => {
                            if !fixer(&err).await {
                                return self.escalate(ctx, attempts, err, started).await;
                            }
                        }
                        _ => return self.escalate(ctx, attempts, err, started).await,
                    }
                }
            }
        }

        // Unreachable: the loop always returns on the final attempt.
        let err = CategorizedError::fatal("retry loop exhausted without a terminal outcome");
        self.escalate(ctx, attempts, err, started).await
    }

    fn log_attempt(&self, attempt: u32, elapsed: Duration, err: &CategorizedError) -> AttemptLog {
        AttemptLog {
            attempt,
            started_at: Utc::now(),
            duration_ms: elapsed.as_millis() as u64,
            category: err.category,
            message: err.message.clone(),
        }
    }

    fn clear_checkpoint(&self, ctx: &RetryContext) {
        if let Some(pad) = &self.scratchpad
            && let Err(e) = pad.clear_checkpoint(&ctx.project_id, &ctx.task_id)
        {
            warn!(task = %ctx.task_id, "failed to clear checkpoint: {e}");
        }
    }

    async fn escalate<T>(
        &self,
        ctx: &RetryContext,
        attempts: Vec<AttemptLog>,
        err: CategorizedError,
        started: Instant,
    ) -> RetryOutcome<T> {
        let attempt_count = attempts.len() as u32;
        let progress = self
            .load_checkpoint(ctx)
            .ok()
            .flatten()
            .map(|cp| cp.state);
        let report = EscalationReport::new(
            &ctx.task_id,
            &ctx.worker_id,
            err.category,
            &err.message,
            attempts,
            progress,
        );
        warn!(
            task = %ctx.task_id,
            worker = %ctx.worker_id,
            category = %err.category,
            "escalating after {attempt_count} attempt(s): {}",
            err.message
        );
        if let Some(sink) = &self.escalation {
            sink(report);
        }
        RetryOutcome {
            success: false,
            data: None,
            attempts: attempt_count,
            duration: started.elapsed(),
            error: Some(err),
        }
    }
}
