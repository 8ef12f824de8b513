//! End-to-end behaviour of the job engine with scripted generators.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tempfile::tempdir;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use studio_core::admission::RejectReason;
use studio_core::config::{ConfigManager, Settings};
use studio_core::events::{JobEvent, JobEventKind, NotificationSink};
use studio_core::ingest::{IngestError, SignatureVerifier};
use studio_core::models::{
    JobRequest, JobStatus, RawNotification, ResourceClass, StageKind, StageStatus,
};
use studio_core::orchestrator::{
    ContentGenerator, EngineError, GeneratorResult, GeneratorSet, JobEngine, StageContext, StageError,
};
use studio_core::registry::{JobStore, JsonFileStore};

const SECRET: &str = "test-webhook-secret";

/// Succeeds immediately with a reference derived from the job.
struct Immediate(StageKind);

#[async_trait]
impl ContentGenerator for Immediate {
    fn kind(&self) -> StageKind {
        self.0
    }

    async fn generate(&self, ctx: &StageContext) -> GeneratorResult<String> {
        Ok(format!("{}://{}", ctx.stage, ctx.job_id))
    }
}

/// Fails transiently a fixed number of times per job, then succeeds.
struct Flaky {
    kind: StageKind,
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl ContentGenerator for Flaky {
    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn generate(&self, ctx: &StageContext) -> GeneratorResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if ctx.attempt <= self.failures {
            return Err(StageError::transient(format!("upstream busy (attempt {})", ctx.attempt)));
        }
        Ok(format!("{}://{}", ctx.stage, ctx.job_id))
    }
}

/// Blocks every invocation until the test hands out a permit.
struct Held {
    kind: StageKind,
    permits: Arc<Semaphore>,
}

#[async_trait]
impl ContentGenerator for Held {
    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn generate(&self, ctx: &StageContext) -> GeneratorResult<String> {
        match self.permits.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(StageError::fatal("gate closed")),
        }
        Ok(format!("{}://{}", ctx.stage, ctx.job_id))
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<JobEvent>>,
}

impl NotificationSink for Recorder {
    fn publish(&self, event: &JobEvent) {
        self.events.lock().push(event.clone());
    }

    fn name(&self) -> &str {
        "recorder"
    }
}

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.retry.base_delay_ms = 1;
    settings.retry.max_delay_ms = 5;
    settings.retry.stage_timeout_secs = 5;
    settings.logging.job_logs = false;
    settings
}

fn instant_generators() -> GeneratorSet {
    StageKind::ALL
        .iter()
        .fold(GeneratorSet::new(), |set, kind| set.with(Immediate(*kind)))
}

fn engine_with(settings: Settings, generators: GeneratorSet) -> JobEngine {
    JobEngine::in_memory(settings, SECRET, generators).unwrap()
}

fn row(key: &str, stages: &str) -> serde_json::Value {
    json!({
        "row_key": key,
        "fields": {
            "title": format!("Video {}", key),
            "description": "Product teaser",
            "audience": "developers",
            "stages": stages,
            "platforms": "youtube,tiktok",
        }
    })
}

fn notification(source: &str, sequence: u64, rows: Vec<serde_json::Value>) -> RawNotification {
    let body = serde_json::to_vec(&json!({
        "source": source,
        "sequence": sequence,
        "rows": rows,
    }))
    .unwrap();
    let signature = SignatureVerifier::new(SECRET).unwrap().sign(&body);
    RawNotification::new(signature, body)
}

fn request(row_key: &str, stages: Vec<StageKind>) -> JobRequest {
    let mut fields = std::collections::BTreeMap::new();
    fields.insert("title".to_string(), format!("Video {}", row_key));
    fields.insert("description".to_string(), "Product teaser".to_string());
    fields.insert("audience".to_string(), "developers".to_string());
    JobRequest::new("sheet", row_key, fields, stages, vec!["youtube".to_string()])
}

async fn wait_for_status(engine: &JobEngine, job_id: &str, status: JobStatus) {
    for _ in 0..200 {
        if engine.status(job_id).map(|s| s.status) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {} never reached {}", job_id, status);
}

#[tokio::test]
async fn valid_rows_become_jobs_and_malformed_rows_are_reported() {
    let engine = engine_with(settings(), instant_generators());

    let mut malformed = row("r4", "script");
    malformed["fields"]
        .as_object_mut()
        .unwrap()
        .remove("description");
    let raw = notification(
        "sheet",
        7,
        vec![
            row("r1", "script"),
            row("r2", "script,audio"),
            malformed,
            row("r3", "script"),
        ],
    );

    let report = engine.ingest(&raw).unwrap();
    assert!(!report.discarded);
    assert_eq!(report.admitted.len(), 3);
    assert!(report.failed.is_empty());
    assert_eq!(report.schema_errors.len(), 1);
    assert_eq!(report.schema_errors[0].row_key, "r4");
    assert!(report.schema_errors[0].message.contains("description"));
    assert_eq!(engine.validator().watermark("sheet"), Some(7));

    for id in &report.admitted {
        assert_eq!(engine.join(id).await.unwrap(), JobStatus::Completed);
    }
}

#[tokio::test]
async fn transient_stage_failures_are_retried_until_success() {
    let flaky = Arc::new(Flaky {
        kind: StageKind::Audio,
        failures: 2,
        calls: AtomicU32::new(0),
    });
    struct Shared(Arc<Flaky>);

    #[async_trait]
    impl ContentGenerator for Shared {
        fn kind(&self) -> StageKind {
            self.0.kind
        }

        async fn generate(&self, ctx: &StageContext) -> GeneratorResult<String> {
            self.0.generate(ctx).await
        }
    }

    let generators = instant_generators().with(Shared(Arc::clone(&flaky)));
    let engine = engine_with(settings(), generators);

    let decision = engine
        .submit(&request(
            "r1",
            vec![StageKind::Script, StageKind::Audio, StageKind::Video],
        ))
        .unwrap();
    let job_id = decision.job_id.unwrap();

    assert_eq!(engine.join(&job_id).await.unwrap(), JobStatus::Completed);
    let job = engine.registry().get(&job_id).unwrap();
    assert_eq!(job.stages[1].attempts, 3);
    assert!(job.stages.iter().all(|s| s.status == StageStatus::Succeeded));
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);

    let view = engine.status(&job_id).unwrap();
    assert_eq!(view.progress, 100);
    assert!(view.result.is_some());
}

#[tokio::test]
async fn same_idempotency_key_is_rejected_while_live() {
    let gate = Arc::new(Semaphore::new(0));
    let generators = instant_generators().with(Held {
        kind: StageKind::Script,
        permits: Arc::clone(&gate),
    });
    let engine = engine_with(settings(), generators);

    let req = request("r1", vec![StageKind::Script]);
    let first = engine.submit(&req).unwrap();
    let second = engine.submit(&req).unwrap();

    assert!(first.accepted);
    assert!(!second.accepted);
    assert_eq!(second.reason, Some(RejectReason::Duplicate));
    let json = serde_json::to_value(&second).unwrap();
    assert_eq!(json["reason"], "duplicate");

    gate.add_permits(1);
    let first_id = first.job_id.unwrap();
    assert_eq!(engine.join(&first_id).await.unwrap(), JobStatus::Completed);

    // Once the first job is terminal the key is free again.
    let third = engine.submit(&req).unwrap();
    assert!(third.accepted);
    gate.add_permits(1);
    engine.join(&third.job_id.unwrap()).await.unwrap();
}

#[tokio::test]
async fn video_capacity_is_bounded_and_freed_on_completion() {
    let mut settings = settings();
    settings.admission.video_slots = 2;
    let gate = Arc::new(Semaphore::new(0));
    let generators = instant_generators().with(Held {
        kind: StageKind::Video,
        permits: Arc::clone(&gate),
    });
    let engine = engine_with(settings, generators);

    let a = engine.submit(&request("v1", vec![StageKind::Video])).unwrap();
    let b = engine.submit(&request("v2", vec![StageKind::Video])).unwrap();
    assert!(a.accepted && b.accepted);
    let (a, b) = (a.job_id.unwrap(), b.job_id.unwrap());

    let extra = request("v3", vec![StageKind::Video]);
    let rejected = engine.submit(&extra).unwrap();
    assert_eq!(rejected.reason, Some(RejectReason::OverCapacity));
    assert!(rejected.job_id.is_none());

    let stats = engine.stats();
    assert_eq!(stats.slots[&ResourceClass::Video].in_flight, 2);
    assert!(stats.jobs.running_by_class.get(&ResourceClass::Video).copied().unwrap_or(0) <= 2);

    gate.add_permits(1);
    let finished = tokio::select! {
        status = engine.join(&a) => status.unwrap(),
        status = engine.join(&b) => status.unwrap(),
    };
    assert_eq!(finished, JobStatus::Completed);

    let resubmitted = engine.submit(&extra).unwrap();
    assert!(resubmitted.accepted);

    gate.add_permits(2);
    for id in [a, b, resubmitted.job_id.unwrap()] {
        assert_eq!(engine.join(&id).await.unwrap(), JobStatus::Completed);
    }
}

#[tokio::test]
async fn replayed_notification_is_discarded() {
    let engine = engine_with(settings(), instant_generators());
    let raw = notification("sheet", 3, vec![row("r1", "script")]);

    let first = engine.ingest(&raw).unwrap();
    assert_eq!(first.admitted.len(), 1);

    let replay = engine.ingest(&raw).unwrap();
    assert!(replay.discarded);
    assert!(replay.admitted.is_empty());
    assert!(replay.rejected.is_empty());
    assert_eq!(engine.registry().len(), 1);

    // Older sequences are discarded too, whatever their content.
    let stale = engine
        .ingest(&notification("sheet", 2, vec![row("r9", "script")]))
        .unwrap();
    assert!(stale.discarded);
    assert_eq!(engine.registry().len(), 1);
}

#[tokio::test]
async fn bad_signature_is_rejected_without_side_effects() {
    let engine = engine_with(settings(), instant_generators());
    let mut raw = notification("sheet", 1, vec![row("r1", "script")]);
    raw.signature = Some("0".repeat(64));

    let err = engine.ingest(&raw).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Ingest(IngestError::Authentication(_))
    ));
    assert_eq!(engine.validator().watermark("sheet"), None);
    assert!(engine.registry().is_empty());

    let unsigned = RawNotification::unsigned(raw.body.clone());
    assert!(engine.ingest(&unsigned).is_err());
}

#[tokio::test]
async fn budget_ceiling_rejects_expensive_work() {
    let mut settings = settings();
    // A video job (2.50 + 0.15) reserves 2.915 at the base band.
    settings.admission.budget_ceiling = 4.0;
    let gate = Arc::new(Semaphore::new(0));
    let generators = instant_generators().with(Held {
        kind: StageKind::Video,
        permits: Arc::clone(&gate),
    });
    let engine = engine_with(settings, generators);

    let first = engine.submit(&request("v1", vec![StageKind::Video])).unwrap();
    assert!(first.accepted);
    let over = engine.submit(&request("v2", vec![StageKind::Video])).unwrap();
    assert_eq!(over.reason, Some(RejectReason::BudgetExceeded));
    assert!(engine.stats().jobs.committed_cost <= 4.0);

    // Cheap text work still fits next to the live reservation.
    let cheap = engine.submit(&request("t1", vec![StageKind::Script])).unwrap();
    assert!(cheap.accepted);

    gate.add_permits(1);
    assert_eq!(engine.join(&first.job_id.unwrap()).await.unwrap(), JobStatus::Completed);
    engine.join(&cheap.job_id.unwrap()).await.unwrap();

    // The finished job no longer counts against the ceiling.
    let retry = engine.submit(&request("v2", vec![StageKind::Video])).unwrap();
    assert!(retry.accepted);
    gate.add_permits(1);
    engine.join(&retry.job_id.unwrap()).await.unwrap();
}

#[tokio::test]
async fn running_job_cancels_at_next_stage_boundary() {
    let gate = Arc::new(Semaphore::new(0));
    let generators = instant_generators().with(Held {
        kind: StageKind::Script,
        permits: Arc::clone(&gate),
    });
    let engine = engine_with(settings(), generators);
    let recorder = Arc::new(Recorder::default());
    engine.add_sink(recorder.clone());

    let decision = engine
        .submit(&request("r1", vec![StageKind::Script, StageKind::Audio]))
        .unwrap();
    let job_id = decision.job_id.unwrap();
    wait_for_status(&engine, &job_id, JobStatus::Running).await;

    assert!(engine.cancel(&job_id).unwrap());
    gate.add_permits(1);
    assert_eq!(engine.join(&job_id).await.unwrap(), JobStatus::Cancelled);

    let job = engine.registry().get(&job_id).unwrap();
    assert_eq!(job.stages[0].status, StageStatus::Pending);
    assert_eq!(job.stages[1].attempts, 0);
    assert!(!engine.cancel(&job_id).unwrap());

    let events = recorder.events.lock();
    let cancelled = events
        .iter()
        .filter(|e| e.job_id == job_id && e.kind == JobEventKind::Cancelled)
        .count();
    assert_eq!(cancelled, 1);
    assert_eq!(events.first().map(|e| e.kind), Some(JobEventKind::Admitted));
}

#[tokio::test]
async fn subscribers_see_lifecycle_in_order() {
    let engine = engine_with(settings(), instant_generators());
    let mut events = engine.subscribe();

    let decision = engine
        .submit(&request("r1", vec![StageKind::Script, StageKind::Platform]))
        .unwrap();
    let job_id = decision.job_id.unwrap();
    engine.join(&job_id).await.unwrap();

    let kinds: Vec<JobEventKind> = events
        .drain()
        .into_iter()
        .filter(|e| e.job_id == job_id)
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            JobEventKind::Admitted,
            JobEventKind::StageStarted,
            JobEventKind::StageCompleted,
            JobEventKind::Progress,
            JobEventKind::StageStarted,
            JobEventKind::StageCompleted,
            JobEventKind::Progress,
            JobEventKind::Completed,
        ]
    );
}

#[tokio::test]
async fn restart_fails_unfinished_jobs_and_keeps_watermarks() {
    let dir = tempdir().unwrap();
    let mut config = ConfigManager::new(dir.path().join("studio.toml"));
    {
        let s = config.settings_mut();
        *s = settings();
        s.paths.data_dir = dir.path().join("jobs").display().to_string();
        s.paths.logs_folder = dir.path().join("logs").display().to_string();
        s.logging.job_logs = true;
        s.ingest.shared_secret = SECRET.to_string();
        s.ingest.secret_env = "STUDIO_TEST_SECRET_NEVER_SET".to_string();
    }

    let gate = Arc::new(Semaphore::new(0));
    let stuck_id = {
        let generators = instant_generators().with(Held {
            kind: StageKind::Script,
            permits: Arc::clone(&gate),
        });
        let engine = JobEngine::open(&config, generators).unwrap();
        let report = engine
            .ingest(&notification("sheet", 11, vec![row("r1", "script")]))
            .unwrap();
        let id = report.admitted[0].clone();
        wait_for_status(&engine, &id, JobStatus::Running).await;
        engine.registry().flush().await;
        id
    };

    let engine = JobEngine::open(&config, instant_generators()).unwrap();
    let view = engine.status(&stuck_id).unwrap();
    assert_eq!(view.status, JobStatus::Failed);
    assert!(view.error.unwrap().contains("restart"));

    let replay = engine
        .ingest(&notification("sheet", 11, vec![row("r1", "script")]))
        .unwrap();
    assert!(replay.discarded);

    // The failed job no longer holds its key.
    let fresh = engine
        .ingest(&notification("sheet", 12, vec![row("r1", "script")]))
        .unwrap();
    assert_eq!(fresh.admitted.len(), 1);
    assert_eq!(engine.join(&fresh.admitted[0]).await.unwrap(), JobStatus::Completed);
    assert!(dir
        .path()
        .join("logs")
        .join(format!("{}.log", fresh.admitted[0]))
        .exists());
}

#[tokio::test]
async fn shutdown_cancels_live_jobs_and_stops_admission() {
    let gate = Arc::new(Semaphore::new(0));
    let generators = instant_generators().with(Held {
        kind: StageKind::Script,
        permits: Arc::clone(&gate),
    });
    let engine = engine_with(settings(), generators);

    let decision = engine
        .submit(&request("r1", vec![StageKind::Script, StageKind::Audio]))
        .unwrap();
    let job_id = decision.job_id.unwrap();
    wait_for_status(&engine, &job_id, JobStatus::Running).await;

    let (live, _) = tokio::join!(engine.shutdown(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.add_permits(1);
    });
    assert_eq!(live, 1);
    assert_eq!(engine.status(&job_id).unwrap().status, JobStatus::Cancelled);

    assert!(matches!(
        engine.submit(&request("r2", vec![StageKind::Script])),
        Err(EngineError::ShuttingDown)
    ));
}

#[test]
fn ingest_outside_runtime_leaves_sequence_unspent() {
    let engine = engine_with(settings(), instant_generators());
    let raw = notification("sheet", 1, vec![row("r1", "script")]);

    assert!(matches!(engine.ingest(&raw), Err(EngineError::Setup(_))));
    assert_eq!(engine.validator().watermark("sheet"), None);
    assert!(engine.registry().is_empty());

    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        let report = engine.ingest(&raw).unwrap();
        assert!(!report.discarded);
        assert_eq!(report.admitted.len(), 1);
        assert_eq!(engine.join(&report.admitted[0]).await.unwrap(), JobStatus::Completed);
    });
    assert_eq!(engine.validator().watermark("sheet"), Some(1));
}

#[tokio::test]
async fn ingest_after_shutdown_leaves_sequence_unspent() {
    let engine = engine_with(settings(), instant_generators());
    assert_eq!(engine.shutdown().await, 0);

    let raw = notification("sheet", 1, vec![row("r1", "script")]);
    assert!(matches!(engine.ingest(&raw), Err(EngineError::ShuttingDown)));
    assert_eq!(engine.validator().watermark("sheet"), None);
    assert!(engine.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_ingest_persists_latest_watermark() {
    let dir = tempdir().unwrap();
    let mut config = settings();
    config.ingest.shared_secret = SECRET.to_string();
    config.ingest.secret_env = "STUDIO_TEST_SECRET_NEVER_SET".to_string();

    let store = Arc::new(JsonFileStore::open(dir.path()).unwrap());
    let engine = JobEngine::new(config.clone(), instant_generators(), store.clone()).unwrap();

    let next = AtomicU64::new(0);
    let handle = Handle::current();
    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                let _runtime = handle.enter();
                for _ in 0..25 {
                    let sequence = next.fetch_add(1, Ordering::SeqCst) + 1;
                    engine.ingest(&notification("sheet", sequence, vec![])).unwrap();
                }
            });
        }
    });

    assert_eq!(engine.validator().watermark("sheet"), Some(200));
    assert_eq!(store.load_watermarks().unwrap().get("sheet"), Some(&200));

    let reopened = JobEngine::new(
        config,
        instant_generators(),
        Arc::new(JsonFileStore::open(dir.path()).unwrap()),
    )
    .unwrap();
    let replay = reopened
        .ingest(&notification("sheet", 200, vec![row("r1", "script")]))
        .unwrap();
    assert!(replay.discarded);
}

#[tokio::test]
async fn per_source_slots_bound_admission_through_ingest() {
    let mut config = settings();
    config.admission.per_source_slots = 1;
    let gate = Arc::new(Semaphore::new(0));
    let generators = instant_generators().with(Held {
        kind: StageKind::Script,
        permits: Arc::clone(&gate),
    });
    let engine = engine_with(config, generators);

    let report = engine
        .ingest(&notification(
            "sheet",
            1,
            vec![row("r1", "script"), row("r2", "script")],
        ))
        .unwrap();
    assert_eq!(report.admitted.len(), 1);
    assert_eq!(report.rejected, vec![("r2".to_string(), RejectReason::OverCapacity)]);

    // Other sources keep their own allowance.
    let other = engine
        .ingest(&notification("crm", 1, vec![row("r3", "script")]))
        .unwrap();
    assert_eq!(other.admitted.len(), 1);

    gate.add_permits(8);
    for id in report.admitted.iter().chain(&other.admitted) {
        assert_eq!(engine.join(id).await.unwrap(), JobStatus::Completed);
    }

    let retry = engine
        .ingest(&notification("sheet", 2, vec![row("r2", "script")]))
        .unwrap();
    assert_eq!(retry.admitted.len(), 1);
    assert_eq!(engine.join(&retry.admitted[0]).await.unwrap(), JobStatus::Completed);
}
