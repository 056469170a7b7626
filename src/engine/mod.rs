//! Orchestration engine: dispatcher, worker pools, retry sweeper,
//! completion aggregator, dead-letter operations.

pub mod completion;
pub mod deadletter;
pub mod dispatcher;
pub mod sweeper;
pub mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::{Broker, SqliteBroker};
use crate::cache::{CachePolicy, StatusCache};
use crate::db::Db;
use crate::error::Result;
use crate::handler::HandlerRegistry;
use crate::model::{ArtifactId, ArtifactType, DeadLetter, JobId, NewJob, QueueEntry};
use crate::publisher::{StatusBus, StatusEvent};
use crate::registry::StageRegistry;
use crate::status::{ArtifactStatusView, JobStatusView, StatusReader};

/// Tunables for the engine's background loops.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Concurrent workers per artifact-type queue.
    pub workers_per_type: usize,
    /// Handler failures tolerated before an entry dead-letters. An entry
    /// is attempted `max_retries + 1` times in total.
    pub max_retries: u32,
    /// First backoff step; delay is `base * 2^retry_count`.
    pub backoff_base: Duration,
    /// Upper bound on any single backoff delay.
    pub backoff_cap: Duration,
    /// How long a blocking pop waits before the worker re-checks shutdown.
    pub pop_timeout: Duration,
    /// Retry sweeper interval.
    pub sweep_interval: Duration,
    /// Reconciliation interval (orphan re-enqueue + job recounts).
    pub reconcile_interval: Duration,
    /// How long an artifact may sit QUEUED before reconciliation treats
    /// its enqueue as lost.
    pub orphan_grace: Duration,
    pub cache: CachePolicy,
    /// Broadcast capacity per watched job.
    pub publisher_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers_per_type: 2,
            max_retries: 3,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(300),
            pop_timeout: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(1),
            reconcile_interval: Duration::from_secs(60),
            orphan_grace: Duration::from_secs(300),
            cache: CachePolicy::default(),
            publisher_capacity: 64,
        }
    }
}

/// State shared by every engine task.
pub(crate) struct EngineInner {
    pub(crate) db: Arc<Db>,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) cache: Arc<StatusCache>,
    pub(crate) bus: Arc<StatusBus>,
    pub(crate) registry: Arc<StageRegistry>,
    pub(crate) handlers: Arc<HandlerRegistry>,
    pub(crate) config: EngineConfig,
    stop: AtomicBool,
    /// Wakes sleeping housekeeping loops on shutdown. Worker pops are not
    /// interrupted; they finish their bounded wait and re-check the flag.
    stop_notify: Notify,
}

impl EngineInner {
    pub(crate) fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Sleep that returns early on shutdown.
    pub(crate) async fn idle(&self, interval: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = self.stop_notify.notified() => {}
        }
    }
}

/// The engine and its spawned background tasks. Dropping without calling
/// [`Engine::shutdown`] aborts nothing; tasks stop at their next flag check
/// once the process exits the runtime.
pub struct Engine {
    inner: Arc<EngineInner>,
    reader: StatusReader,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Wire the components together without spawning anything. Submission,
    /// status, and operator boundaries work; nothing consumes the queues.
    /// This is what one-shot CLI commands use.
    pub fn connect(
        db: Arc<Db>,
        registry: StageRegistry,
        handlers: HandlerRegistry,
        config: EngineConfig,
    ) -> Self {
        let broker: Arc<dyn Broker> = Arc::new(SqliteBroker::new(Arc::clone(&db)));
        let cache = Arc::new(StatusCache::new(config.cache.clone()));
        let bus = Arc::new(StatusBus::new(config.publisher_capacity));
        let registry = Arc::new(registry);
        let handlers = Arc::new(handlers);

        let inner = Arc::new(EngineInner {
            db: Arc::clone(&db),
            broker,
            cache: Arc::clone(&cache),
            bus,
            registry: Arc::clone(&registry),
            handlers,
            config,
            stop: AtomicBool::new(false),
            stop_notify: Notify::new(),
        });

        let reader = StatusReader::new(db, cache, registry);
        Self { inner, reader, tasks: Vec::new() }
    }

    /// Spawn workers, the retry sweeper, and the reconciler, and return the
    /// running engine.
    pub fn start(
        db: Arc<Db>,
        registry: StageRegistry,
        handlers: HandlerRegistry,
        config: EngineConfig,
    ) -> Self {
        let mut engine = Self::connect(db, registry, handlers, config);
        let inner = &engine.inner;

        for artifact_type in ArtifactType::ALL {
            for index in 0..inner.config.workers_per_type {
                let inner = Arc::clone(inner);
                engine
                    .tasks
                    .push(tokio::spawn(worker::run(inner, artifact_type, index)));
            }
        }
        engine
            .tasks
            .push(tokio::spawn(sweeper::run_retry_sweeper(Arc::clone(inner))));
        engine
            .tasks
            .push(tokio::spawn(sweeper::run_reconciler(Arc::clone(inner))));

        info!(
            workers_per_type = inner.config.workers_per_type,
            queues = ArtifactType::ALL.len(),
            "engine started"
        );
        engine
    }

    /// Signal every task to stop and wait for them to drain. In-flight
    /// stage chains run to completion first.
    pub async fn shutdown(self) {
        self.inner.stop.store(true, Ordering::Relaxed);
        self.inner.stop_notify.notify_waiters();
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!("engine task panicked during shutdown: {err}");
            }
        }
        info!("engine stopped");
    }

    // --- Submission boundary ---

    /// Accept a job: rows first, then one queue entry per artifact.
    pub async fn submit(&self, new: NewJob) -> Result<JobId> {
        dispatcher::submit(&self.inner, new).await
    }

    // --- Status boundary ---

    pub async fn job_status(&self, job_id: JobId) -> Result<JobStatusView> {
        self.reader.job_status(job_id).await
    }

    pub async fn artifact_status(&self, artifact_id: ArtifactId) -> Result<ArtifactStatusView> {
        self.reader.artifact_status(artifact_id).await
    }

    pub async fn list_jobs(
        &self,
        case_label: Option<&str>,
        include_archived: bool,
        limit: u32,
    ) -> Result<Vec<crate::model::Job>> {
        self.inner.db.list_jobs(case_label, include_archived, limit).await
    }

    pub async fn archive_job(&self, job_id: JobId) -> Result<()> {
        self.inner.cache.invalidate_status(job_id, None).await;
        self.inner.db.archive_job(job_id).await
    }

    // --- Event boundary ---

    /// Live event stream for one job.
    pub async fn subscribe(&self, job_id: JobId) -> tokio::sync::broadcast::Receiver<StatusEvent> {
        self.inner.bus.subscribe(job_id).await
    }

    // --- Downstream boundary ---

    /// A shared downstream collaborator finished its stage for this
    /// artifact; completes it and recounts the owning job.
    pub async fn complete_downstream(&self, artifact_id: ArtifactId) -> Result<()> {
        completion::complete_downstream(&self.inner, artifact_id).await
    }

    // --- Dead-letter operator boundary ---

    pub async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>> {
        self.inner.broker.list_dead(queue).await
    }

    pub async fn replay_dead_letter(&self, queue: &str, seq: i64) -> Result<QueueEntry> {
        deadletter::replay(&self.inner, queue, seq).await
    }

    pub async fn purge_dead_letter(&self, queue: &str, seq: i64) -> Result<()> {
        deadletter::purge(&self.inner, queue, seq).await
    }

    // --- Diagnostics ---

    pub async fn queue_depth(&self, queue: &str) -> Result<u64> {
        self.inner.broker.len(queue).await
    }

    pub async fn retry_depth(&self, queue: &str) -> Result<u64> {
        self.inner.broker.retry_len(queue).await
    }

    pub async fn health(&self) -> Result<()> {
        self.inner.db.health_check().await
    }

    /// One immediate reconciliation pass, outside the timer. Exposed for
    /// operators who do not want to wait out the interval after a crash.
    pub async fn reconcile_now(&self) -> Result<()> {
        sweeper::reconcile_once(&self.inner).await
    }
}
