//! Operator actions on the dead-letter store.
//!
//! Replay flips the rows first and re-enqueues second: if the process dies
//! between the two, the artifact sits QUEUED with no entry, which the
//! reconciler repairs. The reverse order could hand a worker an entry whose
//! artifact is still FAILED, and that entry would be dropped as stale.

use chrono::Utc;
use tracing::info;

use super::{completion, EngineInner};
use crate::error::{Error, Result};
use crate::model::QueueEntry;
use crate::publisher::StatusEvent;

/// Re-enqueue one dead letter: artifact back to QUEUED with a fresh retry
/// budget, owning job back to PROCESSING when it had failed, entry back on
/// the tail of its original work queue.
pub(crate) async fn replay(inner: &EngineInner, queue: &str, seq: i64) -> Result<QueueEntry> {
    let dead = inner
        .broker
        .list_dead(queue)
        .await?
        .into_iter()
        .find(|d| d.seq == seq)
        .ok_or_else(|| Error::NotFound(format!("dead letter {seq} in {queue}")))?;

    let artifact_id = dead.entry.artifact_id;
    let job_id = dead.entry.job_id;
    let now = Utc::now();

    inner.cache.invalidate_status(job_id, Some(artifact_id)).await;
    inner.db.replay_artifact(artifact_id, now).await?;
    if inner.db.mark_job_reprocessing(job_id, now).await? {
        completion::publish_job_event(inner, job_id).await?;
    }

    let entry = inner.broker.replay_dead(queue, seq).await?;

    let artifact = inner.db.get_artifact(artifact_id).await?;
    inner.bus.emit_lossy(StatusEvent::artifact(&artifact)).await;
    info!(queue, seq, artifact = %artifact_id, "dead letter replayed");
    Ok(entry)
}

/// Drop one dead letter for good. The artifact stays FAILED.
pub(crate) async fn purge(inner: &EngineInner, queue: &str, seq: i64) -> Result<()> {
    inner.broker.purge_dead(queue, seq).await?;
    info!(queue, seq, "dead letter purged");
    Ok(())
}
