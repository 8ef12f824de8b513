//! Engine facade wiring intake, admission, execution and events.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::watch;

use super::errors::{EngineError, EngineResult};
use super::executor::{CancelHandle, JobLineCallback, StageExecutor};
use super::generator::GeneratorSet;
use super::retry::RetryPolicy;
use crate::admission::{Admission, AdmissionController, AdmissionDecision, RejectReason, SlotUsage};
use crate::config::{ConfigError, ConfigManager, Settings};
use crate::events::{BroadcastStats, EventBroadcaster, JobEvent, JobEventKind, NotificationSink, Subscription};
use crate::ingest::{ChangeValidator, IngestError, SchemaError};
use crate::logging::LogConfig;
use crate::models::{JobId, JobRequest, JobStatus, JobStatusView, RawNotification, ResourceClass, StageKind};
use crate::registry::{JobRegistry, JobStore, JsonFileStore, MemoryStore, RegistryError, RegistrySnapshot};

/// What happened to one change notification.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub source: String,
    pub sequence: u64,
    /// Replayed or stale notification; nothing was admitted.
    pub discarded: bool,
    pub admitted: Vec<JobId>,
    /// Rows that produced a request but were not admitted.
    pub rejected: Vec<(String, RejectReason)>,
    /// Rows whose submission failed outright (row key, error).
    pub failed: Vec<(String, String)>,
    pub schema_errors: Vec<SchemaError>,
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub jobs: RegistrySnapshot,
    pub slots: HashMap<ResourceClass, SlotUsage>,
    pub events: BroadcastStats,
    pub budget_ceiling: f64,
    pub persist_failures: u64,
}

/// Live executor task for one job.
struct RunningJob {
    cancel: CancelHandle,
    done: watch::Receiver<Option<JobStatus>>,
}

/// The job orchestration engine.
///
/// Change notifications flow through [`ingest`](Self::ingest); callers with
/// ready-made requests use [`submit`](Self::submit). Every admitted job runs
/// on its own Tokio task, so both must be called from within a runtime.
///
/// # Example
///
/// ```ignore
/// let generators = GeneratorSet::new()
///     .with(ScriptWriter)
///     .with(VoiceOver)
///     .with(VideoComposer)
///     .with(PlatformAdapter);
/// let engine = JobEngine::open(&config, generators)?;
///
/// let mut events = engine.subscribe();
/// let report = engine.ingest(&RawNotification::new(signature, body))?;
/// for id in &report.admitted {
///     println!("{:?}", engine.join(id).await?);
/// }
/// ```
pub struct JobEngine {
    settings: Settings,
    validator: ChangeValidator,
    registry: Arc<JobRegistry>,
    admission: AdmissionController,
    events: Arc<EventBroadcaster>,
    executor: Arc<StageExecutor>,
    running: Arc<Mutex<HashMap<JobId, RunningJob>>>,
    shutting_down: AtomicBool,
}

impl JobEngine {
    /// Engine over an explicit store, taking the webhook secret from the
    /// ingest settings (environment first).
    pub fn new(settings: Settings, generators: GeneratorSet, store: Arc<dyn JobStore>) -> EngineResult<Self> {
        settings.validate().map_err(ConfigError::Invalid)?;
        let validator = ChangeValidator::from_settings(&settings.ingest)?;
        Self::assemble(settings, validator, generators, store, None)
    }

    /// Engine with an explicit webhook secret and in-memory records.
    /// Per-job log files are not written.
    pub fn in_memory(settings: Settings, secret: impl AsRef<[u8]>, generators: GeneratorSet) -> EngineResult<Self> {
        settings.validate().map_err(ConfigError::Invalid)?;
        let validator = ChangeValidator::new(secret, &settings.ingest)?;
        Self::assemble(settings, validator, generators, Arc::new(MemoryStore::new()), None)
    }

    /// Engine backed by the directories of a loaded config file.
    pub fn open(config: &ConfigManager, generators: GeneratorSet) -> EngineResult<Self> {
        config.ensure_dirs_exist()?;
        let settings = config.settings().clone();
        settings.validate().map_err(ConfigError::Invalid)?;

        let store = JsonFileStore::open(config.data_dir()).map_err(RegistryError::from)?;
        let validator = ChangeValidator::from_settings(&settings.ingest)?;
        let log_dir = settings.logging.job_logs.then(|| config.logs_folder());
        Self::assemble(settings, validator, generators, Arc::new(store), log_dir)
    }

    fn assemble(
        settings: Settings,
        validator: ChangeValidator,
        generators: GeneratorSet,
        store: Arc<dyn JobStore>,
        log_dir: Option<PathBuf>,
    ) -> EngineResult<Self> {
        let missing = generators.missing(&StageKind::ALL);
        if !missing.is_empty() {
            tracing::warn!(?missing, "No generator registered for some stages; jobs requesting them will fail");
        }

        let registry = Arc::new(JobRegistry::new(Arc::clone(&store)));
        let reconciled = registry.recover()?;
        validator.restore_watermarks(store.load_watermarks().map_err(RegistryError::from)?);

        let events = Arc::new(EventBroadcaster::new(settings.events.subscriber_buffer));
        let admission = AdmissionController::from_settings(Arc::clone(&registry), &settings);

        let mut executor = StageExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&events),
            generators,
            RetryPolicy::from_settings(&settings.retry),
        )
        .with_log_config(LogConfig::from(&settings.logging));
        if let Some(dir) = log_dir {
            executor = executor.with_job_logs(dir);
        }

        tracing::info!(
            jobs = registry.len(),
            reconciled,
            budget = settings.admission.budget_ceiling,
            "Job engine ready"
        );

        Ok(Self {
            settings,
            validator,
            registry,
            admission,
            events,
            executor: Arc::new(executor),
            running: Arc::new(Mutex::new(HashMap::new())),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Forward every job log line to `callback`.
    ///
    /// Only takes effect before the first job is submitted.
    pub fn with_log_callback(mut self, callback: JobLineCallback) -> Self {
        match Arc::get_mut(&mut self.executor) {
            Some(executor) => executor.set_log_callback(callback),
            None => tracing::warn!("Log callback ignored: jobs are already running"),
        }
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn validator(&self) -> &ChangeValidator {
        &self.validator
    }

    /// Validate a change notification and submit every valid row.
    ///
    /// Replays come back as a discarded report rather than an error.
    /// Authentication and envelope failures are returned as errors, as are
    /// a missing runtime and shutdown; those leave the watermark untouched.
    /// Once validated, every valid row lands in the report.
    pub fn ingest(&self, raw: &RawNotification) -> EngineResult<IngestReport> {
        // Validation spends the sequence, so nothing after it may abort.
        let runtime = self.submission_runtime()?;

        let change = match self.validator.validate(raw) {
            Ok(change) => change,
            Err(IngestError::DuplicateOrOutOfOrder {
                source_id,
                sequence,
                ..
            }) => {
                return Ok(IngestReport {
                    source: source_id,
                    sequence,
                    discarded: true,
                    ..IngestReport::default()
                });
            }
            Err(e) => return Err(e.into()),
        };

        let store = self.registry.store();
        if let Err(e) = self
            .validator
            .persist_watermarks(|marks| store.save_watermarks(marks))
        {
            tracing::error!(source = %change.event.source, "Failed to persist watermarks: {}", e);
        }

        let mut report = IngestReport {
            source: change.event.source.clone(),
            sequence: change.event.sequence,
            schema_errors: change.schema_errors,
            ..IngestReport::default()
        };

        for request in &change.requests {
            match self.submit_on(&runtime, request) {
                Ok(decision) => match (decision.job_id, decision.reason) {
                    (Some(job_id), _) if decision.accepted => report.admitted.push(job_id),
                    (_, Some(reason)) => report.rejected.push((request.row_key.clone(), reason)),
                    _ => {}
                },
                Err(e) => {
                    tracing::error!(
                        source = %report.source,
                        row_key = %request.row_key,
                        "Row not submitted: {}",
                        e
                    );
                    report.failed.push((request.row_key.clone(), e.to_string()));
                }
            }
        }

        tracing::info!(
            source = %report.source,
            sequence = report.sequence,
            admitted = report.admitted.len(),
            rejected = report.rejected.len(),
            failed = report.failed.len(),
            schema_errors = report.schema_errors.len(),
            "Processed change notification"
        );
        Ok(report)
    }

    /// Admit one request and start it when accepted.
    pub fn submit(&self, request: &JobRequest) -> EngineResult<AdmissionDecision> {
        let runtime = self.submission_runtime()?;
        self.submit_on(&runtime, request)
    }

    /// Runtime that admitted jobs will be spawned on.
    fn submission_runtime(&self) -> EngineResult<Handle> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        Handle::try_current().map_err(|_| EngineError::setup("job submission requires a Tokio runtime"))
    }

    fn submit_on(&self, runtime: &Handle, request: &JobRequest) -> EngineResult<AdmissionDecision> {
        // Shutdown may start part way through an ingest batch.
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }

        let admission = self.admission.admit(request)?;
        let decision = admission.decision();

        if let Admission::Accepted {
            job,
            slot,
            estimate,
        } = admission
        {
            self.events.publish(JobEvent::new(
                job.id.clone(),
                JobEventKind::Admitted,
                json!({
                    "source": job.source,
                    "row_key": job.row_key,
                    "stages": request.stages,
                    "estimate": estimate,
                }),
            ));

            let cancel = CancelHandle::new();
            let (done_tx, done_rx) = watch::channel(None);
            self.running.lock().insert(
                job.id.clone(),
                RunningJob {
                    cancel: cancel.clone(),
                    done: done_rx,
                },
            );

            let executor = Arc::clone(&self.executor);
            let running = Arc::clone(&self.running);
            let job_id = job.id;
            runtime.spawn(async move {
                let status = executor.run(&job_id, slot, cancel).await;
                done_tx.send_replace(Some(status));
                running.lock().remove(&job_id);
            });
        }

        Ok(decision)
    }

    /// Request cancellation of a job.
    ///
    /// A queued job is cancelled immediately; a running one stops at its
    /// next stage boundary. Returns `false` when the job had already
    /// finished.
    pub fn cancel(&self, job_id: &str) -> EngineResult<bool> {
        let job = self
            .registry
            .get(job_id)
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
        if job.is_terminal() {
            return Ok(false);
        }

        if let Some(running) = self.running.lock().get(job_id) {
            running.cancel.cancel();
        }

        match self
            .registry
            .update_status(job_id, JobStatus::Queued, JobStatus::Cancelled)
        {
            Ok(job) => {
                tracing::info!(job_id, "Cancelled queued job");
                self.events.publish(JobEvent::new(
                    job_id,
                    JobEventKind::Cancelled,
                    json!({ "stage": job.current_stage_kind(), "progress": job.progress }),
                ));
                Ok(true)
            }
            Err(RegistryError::Conflict { actual, .. }) => {
                if actual == JobStatus::Running {
                    tracing::info!(job_id, "Cancellation requested for running job");
                }
                Ok(!actual.is_terminal())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Status query view of a job.
    pub fn status(&self, job_id: &str) -> Option<JobStatusView> {
        self.registry.status(job_id)
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn add_sink(&self, sink: Arc<dyn NotificationSink>) {
        self.events.add_sink(sink);
    }

    /// Wait until a job reaches a terminal status.
    pub async fn join(&self, job_id: &str) -> EngineResult<JobStatus> {
        let done = self.running.lock().get(job_id).map(|r| r.done.clone());
        if let Some(mut done) = done {
            let finished = done.wait_for(Option::is_some).await.ok().and_then(|s| *s);
            if let Some(status) = finished {
                return Ok(status);
            }
        }

        self.registry
            .get(job_id)
            .map(|job| job.status)
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))
    }

    /// Stop admitting, cancel every live job and wait for them to stop.
    /// Job records are flushed to the store before returning.
    ///
    /// Returns the number of jobs that were still live.
    pub async fn shutdown(&self) -> usize {
        self.shutting_down.store(true, Ordering::SeqCst);

        let live: Vec<JobId> = self.running.lock().keys().cloned().collect();
        tracing::info!(jobs = live.len(), "Shutting down job engine");

        for job_id in &live {
            if let Err(e) = self.cancel(job_id) {
                tracing::warn!(job_id = %job_id, "Cancel during shutdown failed: {}", e);
            }
        }
        for job_id in &live {
            if let Err(e) = self.join(job_id).await {
                tracing::warn!(job_id = %job_id, "Join during shutdown failed: {}", e);
            }
        }
        self.registry.flush().await;
        live.len()
    }

    pub fn stats(&self) -> EngineStats {
        let slots = ResourceClass::ALL
            .iter()
            .map(|class| (*class, self.admission.slots().usage(*class)))
            .collect();

        EngineStats {
            jobs: self.registry.snapshot(),
            slots,
            events: self.events.stats(),
            budget_ceiling: self.admission.budget_ceiling(),
            persist_failures: self.registry.persist_failures(),
        }
    }
}
