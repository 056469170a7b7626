//! Submission intake: job + artifact rows, then one queue entry per
//! artifact.
//!
//! Row creation is one transaction; the enqueues that follow are not part
//! of it. An enqueue lost to a crash leaves the artifact QUEUED in storage,
//! which the reconciliation sweep re-enqueues after the grace window.

use std::collections::BTreeMap;

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{info, warn};

use super::EngineInner;
use crate::error::{Error, Result};
use crate::model::{Artifact, ArtifactId, ArtifactStatus, Job, JobId, JobStatus, NewJob, QueueEntry};
use crate::telemetry::metrics;

pub(crate) async fn submit(inner: &EngineInner, new: NewJob) -> Result<JobId> {
    if new.artifacts.is_empty() {
        return Err(Error::InvalidSubmission(
            "a job needs at least one artifact".to_string(),
        ));
    }
    if let Some(parent_id) = new.parent_id {
        // Reject dangling parents up front instead of at read time.
        inner.db.get_job(parent_id).await.map_err(|err| match err {
            Error::NotFound(_) => {
                Error::InvalidSubmission(format!("parent job {parent_id} does not exist"))
            }
            other => other,
        })?;
    }

    let now = Utc::now();
    let job = Job {
        id: JobId::new(),
        case_label: new.case_label,
        parent_id: new.parent_id,
        status: JobStatus::Queued,
        total_files: new.artifacts.len() as u32,
        archived: false,
        created_at: now,
        started_at: None,
        completed_at: None,
    };

    let artifacts: Vec<Artifact> = new
        .artifacts
        .into_iter()
        .map(|input| Artifact {
            id: ArtifactId::new(),
            job_id: job.id,
            artifact_type: input.artifact_type,
            filename: input.filename,
            source_ref: input.source_ref,
            options: input.options,
            status: ArtifactStatus::Queued,
            current_stage: None,
            stage_timings: BTreeMap::new(),
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        })
        .collect();

    inner.db.insert_submission(&job, &artifacts).await?;

    for artifact in &artifacts {
        metrics::artifacts_submitted().add(
            1,
            &[KeyValue::new("artifact_type", artifact.artifact_type.as_str())],
        );
        let entry = QueueEntry::new(job.id, artifact.id, artifact.artifact_type.queue_name());
        if let Err(err) = inner.broker.push(entry).await {
            // Rows are committed; reconciliation picks this artifact up.
            warn!(
                job = %job.id,
                artifact = %artifact.id,
                "enqueue failed after insert: {err}"
            );
        }
    }

    info!(job = %job.id, files = job.total_files, "job submitted");
    Ok(job.id)
}
