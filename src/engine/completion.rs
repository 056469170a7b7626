//! Completion aggregator: authoritative recounts after terminal artifact
//! transitions, plus the shared-downstream completion boundary.
//!
//! Recounts never trust a cached delta. Both job flips are conditional
//! single-statement updates with the count predicate inside, so two
//! artifacts of one job finishing concurrently cannot double-complete or
//! drop the final flip.

use chrono::Utc;
use tracing::info;

use super::EngineInner;
use crate::error::Result;
use crate::model::{ArtifactId, ArtifactStatus, JobId};
use crate::publisher::StatusEvent;

/// Recount the job's artifacts and flip its status when warranted:
/// COMPLETED when every artifact completed, FAILED when all are terminal
/// and at least one failed. Publishes the fresh aggregate either way.
pub(crate) async fn recompute_job(inner: &EngineInner, job_id: JobId) -> Result<()> {
    let now = Utc::now();
    inner.cache.invalidate_status(job_id, None).await;

    let completed = inner.db.try_complete_job(job_id, now).await?;
    if completed {
        info!(job = %job_id, "job completed");
    } else if inner.db.try_fail_job(job_id, now).await? {
        info!(job = %job_id, "job failed");
    }

    publish_job_event(inner, job_id).await
}

/// Emit the job's current aggregate to its watchers.
pub(crate) async fn publish_job_event(inner: &EngineInner, job_id: JobId) -> Result<()> {
    let job = inner.db.get_job(job_id).await?;
    let counts = inner.db.artifact_counts(job_id).await?;
    inner.bus.emit_lossy(StatusEvent::job(&job, counts.completed)).await;
    Ok(())
}

/// The shared downstream collaborator finished its stage for one parked
/// artifact: AWAITING_DOWNSTREAM becomes COMPLETED, then the job is
/// recounted. Fails loudly when the artifact is in any other status.
pub(crate) async fn complete_downstream(inner: &EngineInner, artifact_id: ArtifactId) -> Result<()> {
    let mut artifact = inner.db.get_artifact(artifact_id).await?;
    let now = Utc::now();

    inner.cache.invalidate_status(artifact.job_id, Some(artifact_id)).await;
    inner.db.complete_downstream_artifact(artifact_id, now).await?;

    artifact.status = ArtifactStatus::Completed;
    artifact.completed_at = Some(now);
    inner.bus.emit_lossy(StatusEvent::artifact(&artifact)).await;
    info!(artifact = %artifact_id, "downstream stage completed");

    recompute_job(inner, artifact.job_id).await
}
