//! End-to-end engine tests: submission through stage chains to terminal
//! job states, all against in-memory SQLite with stub stage handlers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use intake::cache::CachePolicy;
use intake::db::Db;
use intake::engine::{Engine, EngineConfig};
use intake::error::{Error, Result};
use intake::handler::{HandlerRegistry, StageHandler, StageOutcome, StageRequest};
use intake::model::*;
use intake::publisher::StatusEvent;
use intake::registry::StageRegistry;
use intake::status::{ArtifactStatusView, JobStatusView};
use tokio::sync::Semaphore;

const DOCUMENT_STAGES: [&str; 5] = ["extract", "ocr", "translate", "summarize", "index"];
const AUDIO_STAGES: [&str; 5] = ["transcode", "transcribe", "translate", "summarize", "index"];

// ---------------------------------------------------------------------------
// Stage handler stubs
// ---------------------------------------------------------------------------

/// Advances every stage and records the order stages ran in.
struct Recording {
    calls: Mutex<Vec<String>>,
}

impl Recording {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StageHandler for Recording {
    async fn run(&self, request: &StageRequest) -> Result<StageOutcome> {
        self.calls.lock().unwrap().push(request.stage.clone());
        Ok(StageOutcome::advance())
    }
}

/// Fails its first `n` invocations, then advances. Counts every call.
struct FailFirst {
    remaining: AtomicU32,
    calls: AtomicU32,
}

impl FailFirst {
    fn new(n: u32) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicU32::new(n),
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl StageHandler for FailFirst {
    async fn run(&self, _request: &StageRequest) -> Result<StageOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok();
        if failing {
            Err(Error::Other("simulated stage fault".to_string()))
        } else {
            Ok(StageOutcome::advance())
        }
    }
}

/// Fails every invocation for one filename, advances for the rest.
struct FailFile {
    filename: &'static str,
    failures: AtomicU32,
}

impl FailFile {
    fn new(filename: &'static str) -> Arc<Self> {
        Arc::new(Self {
            filename,
            failures: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl StageHandler for FailFile {
    async fn run(&self, request: &StageRequest) -> Result<StageOutcome> {
        if request.filename == self.filename {
            self.failures.fetch_add(1, Ordering::SeqCst);
            Err(Error::Other("poisoned input".to_string()))
        } else {
            Ok(StageOutcome::advance())
        }
    }
}

/// Reports the shared-downstream signal.
struct Defer;

#[async_trait]
impl StageHandler for Defer {
    async fn run(&self, _request: &StageRequest) -> Result<StageOutcome> {
        Ok(StageOutcome::Deferred)
    }
}

/// Blocks until the test opens the gate, then advances.
struct Gated {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl StageHandler for Gated {
    async fn run(&self, _request: &StageRequest) -> Result<StageOutcome> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|err| Error::Other(err.to_string()))?;
        Ok(StageOutcome::advance())
    }
}

fn recording_for(stages: &[&str]) -> (HandlerRegistry, Arc<Recording>) {
    let recorder = Recording::new();
    let mut handlers = HandlerRegistry::empty();
    for stage in stages {
        handlers.register(*stage, recorder.clone());
    }
    (handlers, recorder)
}

// ---------------------------------------------------------------------------
// Engine setup
// ---------------------------------------------------------------------------

/// Millisecond-scale intervals so retries and sweeps resolve quickly.
fn fast_config() -> EngineConfig {
    EngineConfig {
        workers_per_type: 1,
        max_retries: 3,
        backoff_base: Duration::from_millis(20),
        backoff_cap: Duration::from_millis(100),
        pop_timeout: Duration::from_millis(50),
        sweep_interval: Duration::from_millis(25),
        reconcile_interval: Duration::from_secs(300),
        cache: CachePolicy {
            status_ttl: Duration::from_millis(50),
            ..CachePolicy::default()
        },
        ..EngineConfig::default()
    }
}

async fn start_engine_with(handlers: HandlerRegistry, config: EngineConfig) -> (Engine, Arc<Db>) {
    let db = Arc::new(Db::in_memory().await.expect("in-memory db"));
    let engine = Engine::start(Arc::clone(&db), StageRegistry::builtin(), handlers, config);
    (engine, db)
}

async fn start_engine(handlers: HandlerRegistry) -> (Engine, Arc<Db>) {
    start_engine_with(handlers, fast_config()).await
}

async fn stop(engine: Engine) {
    tokio::time::timeout(Duration::from_secs(2), engine.shutdown())
        .await
        .expect("shutdown should finish before the deadline");
}

async fn wait_for_job(engine: &Engine, job_id: JobId, want: JobStatus) -> JobStatusView {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let view = engine.job_status(job_id).await.expect("job status");
        if view.status == want {
            return view;
        }
        if view.status.is_terminal() {
            panic!("job reached {} while waiting for {want}", view.status);
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {want}, current: {}", view.status);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_artifact(
    engine: &Engine,
    id: ArtifactId,
    want: ArtifactStatus,
) -> ArtifactStatusView {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let view = engine.artifact_status(id).await.expect("artifact status");
        if view.status == want {
            return view;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {want}, current: {}", view.status);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn document_chain_runs_stages_in_declared_order() {
    let (handlers, recorder) = recording_for(&DOCUMENT_STAGES);
    let (engine, _db) = start_engine(handlers).await;

    let job_id = engine
        .submit(NewJob::new().artifact(NewArtifact::new("report.pdf", ArtifactType::Document)))
        .await
        .expect("submit");

    let view = wait_for_job(&engine, job_id, JobStatus::Completed).await;
    assert_eq!(view.total_files, 1);
    assert_eq!(view.processed_files, 1);
    assert_eq!(view.progress_percentage, 100.0);
    assert!(view.completed_at.is_some());

    assert_eq!(recorder.calls(), DOCUMENT_STAGES);

    let artifact = &view.artifacts[0];
    assert_eq!(artifact.status, ArtifactStatus::Completed);
    assert_eq!(artifact.progress_percentage, 100.0);
    assert_eq!(artifact.current_stage.as_deref(), Some("index"));
    let timed: Vec<&str> = artifact.stage_timings.keys().map(String::as_str).collect();
    let mut expected = DOCUMENT_STAGES.to_vec();
    expected.sort_unstable();
    assert_eq!(timed, expected);

    stop(engine).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn job_completes_when_every_artifact_does() {
    let union: Vec<&str> = DOCUMENT_STAGES
        .iter()
        .chain(AUDIO_STAGES.iter())
        .copied()
        .collect();
    let (handlers, recorder) = recording_for(&union);
    let (engine, _db) = start_engine(handlers).await;

    let job_id = engine
        .submit(
            NewJob::new()
                .case_label("case-12")
                .artifact(NewArtifact::new("report.pdf", ArtifactType::Document))
                .artifact(NewArtifact::new("call.mp3", ArtifactType::Audio)),
        )
        .await
        .expect("submit");

    let view = wait_for_job(&engine, job_id, JobStatus::Completed).await;
    assert_eq!(view.processed_files, 2);
    assert_eq!(view.case_label.as_deref(), Some("case-12"));
    assert!(view
        .artifacts
        .iter()
        .all(|a| a.status == ArtifactStatus::Completed));

    // Five stages per artifact, across both queues.
    assert_eq!(recorder.calls().len(), 10);

    let audio = view
        .artifacts
        .iter()
        .find(|a| a.artifact_type == ArtifactType::Audio)
        .expect("audio artifact in view");
    assert!(audio.stage_timings.contains_key("transcode"));
    assert!(audio.stage_timings.contains_key("transcribe"));

    stop(engine).await;
}

// ---------------------------------------------------------------------------
// Failure, retry, dead letter
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_stage_retries_then_succeeds() {
    let flaky = FailFirst::new(2);
    let (mut handlers, _) = recording_for(&DOCUMENT_STAGES[1..]);
    handlers.register("extract", flaky.clone());
    let (engine, _db) = start_engine(handlers).await;

    let job_id = engine
        .submit(NewJob::new().artifact(NewArtifact::new("report.pdf", ArtifactType::Document)))
        .await
        .expect("submit");

    let view = wait_for_job(&engine, job_id, JobStatus::Completed).await;
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);

    let artifact = &view.artifacts[0];
    assert_eq!(artifact.status, ArtifactStatus::Completed);
    // The failure history survives the eventual success.
    assert_eq!(artifact.retry_count, 2);
    assert_eq!(
        artifact.error_message.as_deref(),
        Some("simulated stage fault")
    );
    assert!(artifact.stage_timings.contains_key("extract"));

    assert_eq!(engine.retry_depth("document").await.unwrap(), 0);
    assert!(engine.dead_letters("document").await.unwrap().is_empty());

    stop(engine).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_retries_dead_letter_the_artifact() {
    let flaky = FailFirst::new(u32::MAX);
    let mut handlers = HandlerRegistry::empty();
    handlers.register("extract", flaky.clone());
    let mut config = fast_config();
    config.max_retries = 1;
    let (engine, _db) = start_engine_with(handlers, config).await;

    let job_id = engine
        .submit(NewJob::new().artifact(NewArtifact::new("report.pdf", ArtifactType::Document)))
        .await
        .expect("submit");

    let view = wait_for_job(&engine, job_id, JobStatus::Failed).await;
    let artifact = &view.artifacts[0];
    assert_eq!(artifact.status, ArtifactStatus::Failed);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2); // max_retries + 1 attempts

    let dead = engine.dead_letters("document").await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].failure_count, 2);
    assert_eq!(dead[0].entry.artifact_id, artifact.artifact_id);
    assert_eq!(dead[0].last_error, "simulated stage fault");

    assert_eq!(engine.queue_depth("document").await.unwrap(), 0);
    assert_eq!(engine.retry_depth("document").await.unwrap(), 0);

    stop(engine).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_failing_artifact_does_not_corrupt_its_siblings() {
    let selective = FailFile::new("bad.pdf");
    let mut handlers = HandlerRegistry::empty();
    for stage in DOCUMENT_STAGES {
        handlers.register(stage, selective.clone());
    }
    let (engine, _db) = start_engine(handlers).await; // max_retries = 3

    let job_id = engine
        .submit(
            NewJob::new()
                .artifact(NewArtifact::new("good-1.pdf", ArtifactType::Document))
                .artifact(NewArtifact::new("bad.pdf", ArtifactType::Document))
                .artifact(NewArtifact::new("good-2.pdf", ArtifactType::Document)),
        )
        .await
        .expect("submit");

    let view = wait_for_job(&engine, job_id, JobStatus::Failed).await;
    assert_eq!(view.total_files, 3);
    assert_eq!(view.processed_files, 2);
    // The initial attempt plus the full retry budget.
    assert_eq!(selective.failures.load(Ordering::SeqCst), 4);

    let failed: Vec<_> = view
        .artifacts
        .iter()
        .filter(|a| a.status == ArtifactStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].filename, "bad.pdf");
    assert_eq!(failed[0].retry_count, 4);
    assert_eq!(failed[0].error_message.as_deref(), Some("poisoned input"));

    // The siblings rode the same queue to completion, untouched.
    assert!(view
        .artifacts
        .iter()
        .filter(|a| a.filename != "bad.pdf")
        .all(|a| a.status == ArtifactStatus::Completed && a.progress_percentage == 100.0));

    let dead = engine.dead_letters("document").await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].failure_count, 4);
    assert_eq!(dead[0].entry.artifact_id, failed[0].artifact_id);

    stop(engine).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replaying_a_dead_letter_reopens_and_completes_the_job() {
    // Fails exactly once; with no retry budget that one failure is fatal.
    let flaky = FailFirst::new(1);
    let (mut handlers, _) = recording_for(&DOCUMENT_STAGES[1..]);
    handlers.register("extract", flaky.clone());
    let mut config = fast_config();
    config.max_retries = 0;
    let (engine, _db) = start_engine_with(handlers, config).await;

    let job_id = engine
        .submit(NewJob::new().artifact(NewArtifact::new("report.pdf", ArtifactType::Document)))
        .await
        .expect("submit");

    wait_for_job(&engine, job_id, JobStatus::Failed).await;
    let dead = engine.dead_letters("document").await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].failure_count, 1);

    let replayed = engine
        .replay_dead_letter("document", dead[0].seq)
        .await
        .expect("replay");
    assert_eq!(replayed.retry_count, 0);

    let view = wait_for_job(&engine, job_id, JobStatus::Completed).await;
    let artifact = &view.artifacts[0];
    assert_eq!(artifact.status, ArtifactStatus::Completed);
    assert_eq!(artifact.retry_count, 0); // replay resets the budget
    assert!(engine.dead_letters("document").await.unwrap().is_empty());

    stop(engine).await;
}

#[tokio::test]
async fn replay_does_not_regress_artifact_progress() {
    let db = Arc::new(Db::in_memory().await.expect("in-memory db"));
    let mut config = fast_config();
    config.cache.status_ttl = Duration::ZERO; // every read sees fresh rows
    let engine = Engine::connect(
        Arc::clone(&db),
        StageRegistry::builtin(),
        HandlerRegistry::empty(),
        config,
    );

    let job_id = engine
        .submit(NewJob::new().artifact(NewArtifact::new("report.pdf", ArtifactType::Document)))
        .await
        .expect("submit");
    let artifact_id = engine.job_status(job_id).await.unwrap().artifacts[0].artifact_id;

    // Walk the artifact by hand: extract finishes, ocr fails for good.
    db.mark_artifact_processing(artifact_id, "extract", Utc::now())
        .await
        .unwrap();
    db.record_stage_timing(artifact_id, "extract", 0.3, Utc::now())
        .await
        .unwrap();
    db.mark_artifact_processing(artifact_id, "ocr", Utc::now())
        .await
        .unwrap();
    db.record_artifact_failure(artifact_id, "ocr engine oom", Utc::now())
        .await
        .unwrap();
    db.fail_artifact(artifact_id, Utc::now()).await.unwrap();

    let failed = engine.artifact_status(artifact_id).await.unwrap();
    assert_eq!(failed.status, ArtifactStatus::Failed);
    assert_eq!(failed.progress_percentage, 40.0); // stage 2 of 5

    // Back to QUEUED, but the recorded extract timing still counts.
    db.replay_artifact(artifact_id, Utc::now()).await.unwrap();
    let replayed = engine.artifact_status(artifact_id).await.unwrap();
    assert_eq!(replayed.status, ArtifactStatus::Queued);
    assert_eq!(replayed.progress_percentage, failed.progress_percentage);

    // A fresh queued artifact with nothing on record still reads 0.
    let fresh_job = engine
        .submit(NewJob::new().artifact(NewArtifact::new("fresh.pdf", ArtifactType::Document)))
        .await
        .expect("submit");
    let fresh = engine.job_status(fresh_job).await.unwrap();
    assert_eq!(fresh.artifacts[0].progress_percentage, 0.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_handler_dead_letters_without_retrying() {
    let (engine, _db) = start_engine(HandlerRegistry::empty()).await;

    let job_id = engine
        .submit(NewJob::new().artifact(NewArtifact::new("report.pdf", ArtifactType::Document)))
        .await
        .expect("submit");

    let view = wait_for_job(&engine, job_id, JobStatus::Failed).await;
    let artifact = &view.artifacts[0];
    assert_eq!(artifact.status, ArtifactStatus::Failed);
    assert!(
        artifact
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("no handler"),
        "got {:?}",
        artifact.error_message
    );

    // Configuration holes are not retried.
    let dead = engine.dead_letters("document").await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].failure_count, 1);

    stop(engine).await;
}

// ---------------------------------------------------------------------------
// Shared downstream stage
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deferred_artifact_waits_for_the_downstream_call() {
    let (mut handlers, _) = recording_for(&DOCUMENT_STAGES[..4]);
    handlers.register("index", Arc::new(Defer));
    let (engine, _db) = start_engine(handlers).await;

    let job_id = engine
        .submit(NewJob::new().artifact(NewArtifact::new("report.pdf", ArtifactType::Document)))
        .await
        .expect("submit");

    let artifact_id = engine.job_status(job_id).await.unwrap().artifacts[0].artifact_id;
    let parked = wait_for_artifact(&engine, artifact_id, ArtifactStatus::AwaitingDownstream).await;
    // The deferred stage ran its local half, so its timing is on record
    // like any other finished stage.
    assert_eq!(parked.stage_timings.len(), 5);
    assert!(parked.stage_timings.contains_key("index"));

    // Parked is not terminal: the job must not complete around it.
    let job = engine.job_status(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.processed_files, 0);

    engine
        .complete_downstream(artifact_id)
        .await
        .expect("complete downstream");

    let view = wait_for_job(&engine, job_id, JobStatus::Completed).await;
    assert_eq!(view.processed_files, 1);
    assert_eq!(view.artifacts[0].status, ArtifactStatus::Completed);
    assert_eq!(view.artifacts[0].progress_percentage, 100.0);

    stop(engine).await;
}

// ---------------------------------------------------------------------------
// Status events
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribers_see_transitions_through_to_completion() {
    let gate = Arc::new(Semaphore::new(0));
    let (mut handlers, _) = recording_for(&DOCUMENT_STAGES[1..]);
    handlers.register("extract", Arc::new(Gated { gate: gate.clone() }));
    let (engine, _db) = start_engine(handlers).await;

    let job_id = engine
        .submit(NewJob::new().artifact(NewArtifact::new("report.pdf", ArtifactType::Document)))
        .await
        .expect("submit");

    // Subscribe while the first stage is held at the gate, then release.
    let mut rx = engine.subscribe(job_id).await;
    gate.add_permits(1);

    let mut saw_completed_artifact = false;
    let (processed, total) = loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event stream stalled")
            .expect("event channel closed");
        match event {
            StatusEvent::Artifact { status, .. } => {
                if status == ArtifactStatus::Completed {
                    saw_completed_artifact = true;
                }
            }
            StatusEvent::Job {
                status,
                processed_files,
                total_files,
                ..
            } => {
                if status == JobStatus::Completed {
                    break (processed_files, total_files);
                }
            }
        }
    };

    assert!(saw_completed_artifact);
    assert_eq!((processed, total), (1, 1));

    stop(engine).await;
}

// ---------------------------------------------------------------------------
// Submission validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submission_without_artifacts_is_rejected() {
    let db = Arc::new(Db::in_memory().await.expect("in-memory db"));
    let engine = Engine::connect(
        db,
        StageRegistry::builtin(),
        HandlerRegistry::empty(),
        fast_config(),
    );

    let err = engine.submit(NewJob::new()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidSubmission(_)), "got {err:?}");
}

#[tokio::test]
async fn submission_with_unknown_parent_is_rejected() {
    let db = Arc::new(Db::in_memory().await.expect("in-memory db"));
    let engine = Engine::connect(
        db,
        StageRegistry::builtin(),
        HandlerRegistry::empty(),
        fast_config(),
    );

    let orphan = NewJob::new()
        .parent(JobId::new())
        .artifact(NewArtifact::new("late.pdf", ArtifactType::Document));
    let err = engine.submit(orphan).await.unwrap_err();
    assert!(matches!(err, Error::InvalidSubmission(_)), "got {err:?}");

    // A real parent is accepted.
    let parent_id = engine
        .submit(NewJob::new().artifact(NewArtifact::new("first.pdf", ArtifactType::Document)))
        .await
        .expect("parent submit");
    engine
        .submit(
            NewJob::new()
                .parent(parent_id)
                .artifact(NewArtifact::new("late.pdf", ArtifactType::Document)),
        )
        .await
        .expect("child submit");
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconciliation_recovers_an_artifact_whose_enqueue_was_lost() {
    let (handlers, _) = recording_for(&DOCUMENT_STAGES);
    let mut config = fast_config();
    config.orphan_grace = Duration::from_millis(10);
    let (engine, db) = start_engine_with(handlers, config).await;

    // Insert the rows directly, skipping the enqueue the dispatcher would do.
    let job = Job {
        id: JobId::new(),
        case_label: None,
        parent_id: None,
        status: JobStatus::Queued,
        total_files: 1,
        archived: false,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
    };
    let artifact = Artifact {
        id: ArtifactId::new(),
        job_id: job.id,
        artifact_type: ArtifactType::Document,
        filename: "stranded.pdf".to_string(),
        source_ref: "stranded.pdf".to_string(),
        options: serde_json::Value::Null,
        status: ArtifactStatus::Queued,
        current_stage: None,
        stage_timings: BTreeMap::new(),
        retry_count: 0,
        last_error: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        completed_at: None,
    };
    db.insert_submission(&job, &[artifact])
        .await
        .expect("insert submission");

    // Age the row past the orphan grace, then sweep.
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.reconcile_now().await.expect("reconcile");

    let view = wait_for_job(&engine, job.id, JobStatus::Completed).await;
    assert_eq!(view.processed_files, 1);

    stop(engine).await;
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_stops_all_tasks_promptly() {
    let (engine, _db) = start_engine(HandlerRegistry::empty()).await;
    stop(engine).await;
}
