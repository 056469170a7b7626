//! Housekeeping loops: the retry sweeper and the reconciler.
//!
//! The sweeper moves due retry entries back onto their work queues on a
//! seconds-scale interval. The reconciler closes the two accepted crash
//! gaps: artifacts whose enqueue was lost (stuck QUEUED past the grace
//! window) and jobs whose final recount never ran.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, error, info, warn};

use super::{completion, EngineInner};
use crate::error::Result;
use crate::model::{ArtifactType, QueueEntry};

/// Moves eligible retry entries back to their work queues, every
/// `sweep_interval`. Also evicts expired cache slots while it is awake.
pub(crate) async fn run_retry_sweeper(inner: Arc<EngineInner>) {
    info!("retry sweeper started");

    while !inner.stopping() {
        inner.idle(inner.config.sweep_interval).await;
        if inner.stopping() {
            break;
        }

        for artifact_type in ArtifactType::ALL {
            let queue = artifact_type.queue_name();
            match inner.broker.pop_due(queue, Utc::now()).await {
                Ok(moved) if !moved.is_empty() => {
                    info!(queue, count = moved.len(), "requeued due retries");
                }
                Ok(_) => {}
                Err(err) => error!(queue, "retry sweep failed: {err}"),
            }
        }

        let purged = inner.cache.purge_expired().await;
        if purged > 0 {
            debug!(purged, "evicted expired cache slots");
        }
    }

    info!("retry sweeper stopped");
}

/// Runs a reconciliation pass every `reconcile_interval`.
pub(crate) async fn run_reconciler(inner: Arc<EngineInner>) {
    info!("reconciler started");

    while !inner.stopping() {
        inner.idle(inner.config.reconcile_interval).await;
        if inner.stopping() {
            break;
        }
        if let Err(err) = reconcile_once(&inner).await {
            error!("reconciliation failed: {err}");
        }
    }

    info!("reconciler stopped");
}

/// One reconciliation pass: re-enqueue orphaned artifacts, then recount
/// every unfinished job from authoritative rows.
pub(crate) async fn reconcile_once(inner: &EngineInner) -> Result<()> {
    let grace = ChronoDuration::milliseconds(inner.config.orphan_grace.as_millis() as i64);
    let cutoff = Utc::now() - grace;

    for artifact in inner.db.list_orphaned_artifacts(cutoff, 100).await? {
        let queue = artifact.artifact_type.queue_name();
        if inner.broker.pending(queue, artifact.id).await? {
            // Still enqueued, just a slow backlog.
            continue;
        }
        warn!(
            artifact = %artifact.id,
            job = %artifact.job_id,
            queue,
            "re-enqueueing orphaned artifact"
        );
        inner
            .broker
            .push(QueueEntry::new(artifact.job_id, artifact.id, queue))
            .await?;
    }

    for job_id in inner.db.list_unfinished_jobs(100).await? {
        completion::recompute_job(inner, job_id).await?;
    }

    Ok(())
}
