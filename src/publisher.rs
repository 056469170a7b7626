//! Best-effort status fan-out, one broadcast stream per job.
//!
//! Delivery is lossy by design: a slow subscriber drops oldest events and a
//! missed event is recovered by polling authoritative status. Channels are
//! created on first subscribe and pruned once the last receiver hangs up,
//! so jobs nobody watches cost nothing.

use std::collections::BTreeMap;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::model::{Artifact, ArtifactId, ArtifactStatus, Job, JobId, JobStatus};

/// A push notification emitted on every status-bearing transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    Artifact {
        job_id: JobId,
        artifact_id: ArtifactId,
        filename: String,
        status: ArtifactStatus,
        current_stage: Option<String>,
        stage_timings: BTreeMap<String, f64>,
        last_error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Job {
        job_id: JobId,
        status: JobStatus,
        processed_files: u32,
        total_files: u32,
        timestamp: DateTime<Utc>,
    },
}

impl StatusEvent {
    /// Snapshot of an artifact after a transition.
    pub fn artifact(artifact: &Artifact) -> Self {
        StatusEvent::Artifact {
            job_id: artifact.job_id,
            artifact_id: artifact.id,
            filename: artifact.filename.clone(),
            status: artifact.status,
            current_stage: artifact.current_stage.clone(),
            stage_timings: artifact.stage_timings.clone(),
            last_error: artifact.last_error.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Snapshot of a job after an aggregate recount.
    pub fn job(job: &Job, processed_files: u32) -> Self {
        StatusEvent::Job {
            job_id: job.id,
            status: job.status,
            processed_files,
            total_files: job.total_files,
            timestamp: Utc::now(),
        }
    }

    pub fn job_id(&self) -> JobId {
        match self {
            StatusEvent::Artifact { job_id, .. } | StatusEvent::Job { job_id, .. } => *job_id,
        }
    }
}

/// Per-job broadcast channels behind one lock. Lock hold times are a map
/// lookup plus a non-blocking send.
pub struct StatusBus {
    capacity: usize,
    channels: Mutex<HashMap<JobId, broadcast::Sender<StatusEvent>>>,
}

impl StatusBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Stream of events for one job. Creates the channel on first call;
    /// later subscribers see only events emitted after they join.
    pub async fn subscribe(&self, job_id: JobId) -> broadcast::Receiver<StatusEvent> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Send an event to whoever is watching the job. No subscribers means
    /// no channel and no work; a channel whose last receiver hung up is
    /// pruned here.
    pub async fn emit_lossy(&self, event: StatusEvent) {
        let job_id = event.job_id();
        let mut channels = self.channels.lock().await;
        let Some(tx) = channels.get(&job_id) else {
            return;
        };
        if tx.send(event).is_err() {
            debug!(job_id = %job_id, "dropping status channel with no receivers");
            channels.remove(&job_id);
        }
    }

    /// Jobs with a live channel, for diagnostics.
    pub async fn watched_jobs(&self) -> usize {
        self.channels.lock().await.len()
    }
}
