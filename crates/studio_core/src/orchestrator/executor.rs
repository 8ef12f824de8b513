//! Stage executor: runs one job through its stages in order.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use serde_json::{json, Value};

use super::errors::{GeneratorResult, StageError};
use super::generator::{ContentGenerator, GeneratorSet, StageContext};
use super::retry::RetryPolicy;
use crate::admission::SlotGuard;
use crate::events::{EventBroadcaster, JobEvent, JobEventKind};
use crate::logging::{JobLogger, LineCallback, LogConfig};
use crate::models::{JobStatus, StageKind, StageStatus};
use crate::registry::{JobRegistry, RegistryError};

/// Handle for cancelling a job.
///
/// Cancellation is cooperative: the executor checks the flag between
/// stages and between retry attempts, never during a generator call.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Receives every job log line as `(job_id, line)`.
pub type JobLineCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Result of driving one stage to a decision.
enum StageOutcome {
    Succeeded(String),
    Failed(StageError),
    Cancelled,
}

/// Drives admitted jobs through their stage sequence.
///
/// All job state changes go through the [`JobRegistry`]; the executor only
/// works on clones. Stage failures end up in the job's terminal state and
/// never escape [`run`](Self::run).
pub struct StageExecutor {
    registry: Arc<JobRegistry>,
    events: Arc<EventBroadcaster>,
    generators: GeneratorSet,
    policy: RetryPolicy,
    log_config: LogConfig,
    log_dir: Option<PathBuf>,
    log_callback: Option<JobLineCallback>,
}

impl StageExecutor {
    pub fn new(
        registry: Arc<JobRegistry>,
        events: Arc<EventBroadcaster>,
        generators: GeneratorSet,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            events,
            generators,
            policy,
            log_config: LogConfig::default(),
            log_dir: None,
            log_callback: None,
        }
    }

    /// Write one log file per job into `dir`.
    pub fn with_job_logs(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn with_log_config(mut self, config: LogConfig) -> Self {
        self.log_config = config;
        self
    }

    /// Forward every job log line to `callback`, with or without log files.
    pub fn with_log_callback(mut self, callback: JobLineCallback) -> Self {
        self.log_callback = Some(callback);
        self
    }

    pub(crate) fn set_log_callback(&mut self, callback: JobLineCallback) {
        self.log_callback = Some(callback);
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn generators(&self) -> &GeneratorSet {
        &self.generators
    }

    /// Run a queued job to a terminal status.
    ///
    /// `slot` is released as soon as the job reaches a terminal status,
    /// before the terminal event goes out. A job that is no longer queued
    /// (e.g. cancelled while waiting) is left alone.
    pub async fn run(&self, job_id: &str, slot: SlotGuard, cancel: CancelHandle) -> JobStatus {
        let mut run = JobRun {
            executor: self,
            job_id,
            logger: self.open_logger(job_id),
            cancel,
            slot: Some(slot),
        };
        let status = run.drive().await;
        run.release();
        run.logger.close();
        status
    }

    fn open_logger(&self, job_id: &str) -> JobLogger {
        if let Some(dir) = &self.log_dir {
            match JobLogger::new(job_id, dir, self.log_config.clone(), self.line_callback(job_id)) {
                Ok(logger) => return logger,
                Err(e) => {
                    tracing::warn!(job_id, "Failed to create job log in {}: {}", dir.display(), e)
                }
            }
        }
        JobLogger::in_memory(job_id, self.log_config.clone(), self.line_callback(job_id))
    }

    fn line_callback(&self, job_id: &str) -> Option<LineCallback> {
        let callback = self.log_callback.clone()?;
        let job_id = job_id.to_string();
        let forward: LineCallback = Box::new(move |line: &str| callback(&job_id, line));
        Some(forward)
    }
}

/// State of one executor run.
struct JobRun<'a> {
    executor: &'a StageExecutor,
    job_id: &'a str,
    logger: JobLogger,
    cancel: CancelHandle,
    slot: Option<SlotGuard>,
}

impl<'a> JobRun<'a> {
    fn registry(&self) -> &'a JobRegistry {
        &self.executor.registry
    }

    async fn drive(&mut self) -> JobStatus {
        let job = match self
            .registry()
            .update_status(self.job_id, JobStatus::Queued, JobStatus::Running)
        {
            Ok(job) => job,
            Err(RegistryError::Conflict { actual, .. }) => {
                tracing::debug!(job_id = self.job_id, status = %actual, "Job no longer queued, skipping");
                return actual;
            }
            Err(e) => return self.abandon(e),
        };

        tracing::info!(
            job_id = self.job_id,
            stages = job.stages.len(),
            class = %job.resource_class,
            "Job started"
        );
        self.logger.info(&format!(
            "Job started: '{}' ({} stages)",
            job.title,
            job.stages.len()
        ));

        let total = job.stages.len();
        for index in job.current_stage..total {
            if self.cancel.is_cancelled() {
                return self.finish_cancelled(index);
            }

            let stage = job.stages[index].stage;
            if let Err(e) = self.registry().update(self.job_id, |j| {
                j.current_stage = index;
                j.stages[index].status = StageStatus::Running;
            }) {
                return self.abandon(e);
            }
            self.logger.stage(stage.as_str());
            self.publish(JobEventKind::StageStarted, json!({ "stage": stage, "index": index }));

            match self.run_stage(index, stage).await {
                StageOutcome::Succeeded(output_ref) => {
                    if self.cancel.is_cancelled() {
                        self.logger
                            .warn(&format!("Discarding {} output after cancellation", stage));
                        return self.finish_cancelled(index);
                    }

                    let stored = output_ref.clone();
                    let job = match self.registry().update(self.job_id, move |j| {
                        let result = &mut j.stages[index];
                        result.status = StageStatus::Succeeded;
                        result.output_ref = Some(stored);
                        result.error = None;
                        result.next_eligible_at = None;
                        j.current_stage = index + 1;
                        j.progress = j.computed_progress();
                    }) {
                        Ok(job) => job,
                        Err(e) => return self.abandon(e),
                    };

                    let attempts = job.stages[index].attempts;
                    tracing::info!(job_id = self.job_id, %stage, attempts, progress = job.progress, "Stage succeeded");
                    self.logger
                        .success(&format!("{} completed (attempt {})", stage, attempts));
                    self.logger.progress(u32::from(job.progress));
                    self.publish(
                        JobEventKind::StageCompleted,
                        json!({ "stage": stage, "output_ref": output_ref, "attempts": attempts }),
                    );
                    self.publish(
                        JobEventKind::Progress,
                        json!({
                            "progress": job.progress,
                            "completed_stages": job.completed_stages(),
                            "total_stages": total,
                        }),
                    );
                }
                StageOutcome::Failed(error) => return self.finish_failed(index, stage, error),
                StageOutcome::Cancelled => return self.finish_cancelled(index),
            }
        }

        self.finish_completed()
    }

    /// Invoke the generator for one stage until it succeeds, fails for good
    /// or the job is cancelled between attempts.
    ///
    /// Attempt count and the next eligible start are kept on the stage
    /// record, so the loop is driven entirely by persisted state.
    async fn run_stage(&mut self, index: usize, stage: StageKind) -> StageOutcome {
        let Some(generator) = self.executor.generators.get(stage) else {
            return StageOutcome::Failed(StageError::fatal(format!(
                "no generator registered for stage '{}'",
                stage
            )));
        };
        let policy = self.executor.policy;

        loop {
            if let Some(wait) = self.pending_backoff(index) {
                tokio::time::sleep(wait).await;
                if self.cancel.is_cancelled() {
                    return StageOutcome::Cancelled;
                }
            }

            let job = match self.registry().update(self.job_id, |j| {
                let result = &mut j.stages[index];
                result.attempts += 1;
                result.status = StageStatus::Running;
                result.next_eligible_at = None;
            }) {
                Ok(job) => job,
                Err(e) => {
                    return StageOutcome::Failed(StageError::fatal(format!(
                        "failed to record attempt: {}",
                        e
                    )))
                }
            };
            let Some(ctx) = StageContext::for_stage(&job, index) else {
                return StageOutcome::Failed(StageError::fatal("stage index out of range"));
            };
            let attempt = ctx.attempt;

            self.logger.debug(&format!(
                "Invoking {} generator (attempt {}/{})",
                generator.name(),
                attempt,
                policy.max_attempts()
            ));

            let error = match self.invoke(&generator, &ctx).await {
                Ok(output_ref) => return StageOutcome::Succeeded(output_ref),
                Err(error) => error,
            };
            self.logger
                .detail(&format!("{} attempt {} failed: {}", stage, attempt, error));

            if !policy.should_retry(attempt, &error) {
                return StageOutcome::Failed(error);
            }

            let delay = policy.delay_for(attempt);
            let next = policy.next_eligible_at(Utc::now(), attempt);
            let message = error.to_string();
            let recorded = message.clone();
            if let Err(e) = self.registry().update(self.job_id, move |j| {
                let result = &mut j.stages[index];
                result.error = Some(recorded);
                result.next_eligible_at = Some(next);
            }) {
                return StageOutcome::Failed(StageError::fatal(format!(
                    "failed to record retry: {}",
                    e
                )));
            }

            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            tracing::warn!(job_id = self.job_id, %stage, attempt, delay_ms, "Stage failed, retrying: {}", message);
            self.logger.retry(&format!(
                "{} attempt {} failed, retrying in {}ms: {}",
                stage, attempt, delay_ms, message
            ));
            self.publish(
                JobEventKind::StageRetrying,
                json!({ "stage": stage, "attempt": attempt, "error": message, "delay_ms": delay_ms }),
            );
        }
    }

    /// Time left before the stage may be attempted again.
    fn pending_backoff(&self, index: usize) -> Option<Duration> {
        let job = self.registry().get(self.job_id)?;
        let next = job.stages.get(index)?.next_eligible_at?;
        (next - Utc::now()).to_std().ok()
    }

    /// Call the generator under the stage deadline, containing panics.
    async fn invoke(
        &self,
        generator: &Arc<dyn ContentGenerator>,
        ctx: &StageContext,
    ) -> GeneratorResult<String> {
        let deadline = self.executor.policy.stage_timeout();
        let call = AssertUnwindSafe(generator.generate(ctx)).catch_unwind();

        match tokio::time::timeout(deadline, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(StageError::Panicked(panic_message(&*panic))),
            Err(_) => Err(StageError::Timeout(deadline)),
        }
    }

    fn finish_completed(&mut self) -> JobStatus {
        let result = self.registry().transition(
            self.job_id,
            JobStatus::Running,
            JobStatus::Completed,
            |j| {
                j.progress = 100;
                j.current_stage = j.stages.len();
                j.result = Some(j.assemble_output());
            },
        );
        self.release();

        match result {
            Ok(job) => {
                tracing::info!(job_id = self.job_id, "Job completed");
                self.logger.success("Job completed");
                self.publish(
                    JobEventKind::Completed,
                    json!({ "progress": job.progress, "result": job.result }),
                );
                JobStatus::Completed
            }
            Err(e) => self.lost_transition(e),
        }
    }

    fn finish_failed(&mut self, index: usize, stage: StageKind, error: StageError) -> JobStatus {
        let message = error.to_string();
        let detail = message.clone();
        let result = self.registry().transition(
            self.job_id,
            JobStatus::Running,
            JobStatus::Failed,
            move |j| {
                let mut attempts = 0;
                if let Some(result) = j.stages.get_mut(index) {
                    result.status = StageStatus::Failed;
                    result.error = Some(detail.clone());
                    result.next_eligible_at = None;
                    attempts = result.attempts;
                }
                j.error = Some(format!(
                    "stage '{}' failed after {} attempt(s): {}",
                    stage, attempts, detail
                ));
            },
        );
        self.release();

        match result {
            Ok(job) => {
                let attempts = job.stages.get(index).map_or(0, |s| s.attempts);
                tracing::error!(job_id = self.job_id, %stage, attempts, "Job failed: {}", message);
                self.logger.error(&format!("{} failed: {}", stage, message));
                self.logger.show_tail("failure");
                self.publish(
                    JobEventKind::Failed,
                    json!({ "stage": stage, "attempts": attempts, "error": job.error }),
                );
                JobStatus::Failed
            }
            Err(e) => self.lost_transition(e),
        }
    }

    /// Cancel at the boundary before (or after a discarded) stage `index`.
    fn finish_cancelled(&mut self, index: usize) -> JobStatus {
        let result = self.registry().transition(
            self.job_id,
            JobStatus::Running,
            JobStatus::Cancelled,
            |j| {
                if let Some(result) = j.stages.get_mut(index) {
                    if result.status == StageStatus::Running {
                        result.status = StageStatus::Pending;
                        result.next_eligible_at = None;
                    }
                }
            },
        );
        self.release();

        match result {
            Ok(job) => {
                let stage = job.stages.get(index).map(|s| s.stage);
                tracing::info!(job_id = self.job_id, stage = ?stage, "Job cancelled");
                self.logger.warn("Job cancelled");
                self.publish(
                    JobEventKind::Cancelled,
                    json!({ "stage": stage, "progress": job.progress }),
                );
                JobStatus::Cancelled
            }
            Err(e) => self.lost_transition(e),
        }
    }

    /// A registry write failed outside a terminal transition.
    fn abandon(&mut self, error: RegistryError) -> JobStatus {
        tracing::error!(job_id = self.job_id, "Job run abandoned: {}", error);
        self.logger.error(&format!("Run abandoned: {}", error));
        self.release();
        self.current_status()
    }

    /// A terminal transition lost its compare-and-swap or failed.
    fn lost_transition(&mut self, error: RegistryError) -> JobStatus {
        match error {
            RegistryError::Conflict { actual, .. } => {
                tracing::warn!(job_id = self.job_id, status = %actual, "Job changed status underneath executor");
                actual
            }
            other => {
                tracing::error!(job_id = self.job_id, "Failed to commit terminal status: {}", other);
                self.current_status()
            }
        }
    }

    fn current_status(&self) -> JobStatus {
        self.registry()
            .get(self.job_id)
            .map(|job| job.status)
            .unwrap_or(JobStatus::Failed)
    }

    fn publish(&self, kind: JobEventKind, payload: Value) {
        self.executor
            .events
            .publish(JobEvent::new(self.job_id, kind, payload));
    }

    fn release(&mut self) {
        self.slot.take();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
