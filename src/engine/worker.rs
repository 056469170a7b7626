//! Worker loop: claim an entry, resume the artifact's stage chain, and
//! route the outcome to retry, dead-letter, or completion.
//!
//! The chain resumes at the first stage with no recorded timing, so a
//! retried artifact never re-runs stages that already finished. Every
//! status-bearing write is preceded by a cache invalidation and followed
//! by a best-effort event.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use opentelemetry::KeyValue;
use tokio::time::Duration;
use tracing::{error, info, warn, Instrument};

use super::{completion, EngineInner};
use crate::error::{Error, Result};
use crate::handler::{StageOutcome, StageRequest};
use crate::model::{Artifact, ArtifactStatus, ArtifactType, QueueEntry};
use crate::publisher::StatusEvent;
use crate::registry::StageSequence;
use crate::telemetry::metrics;
use crate::telemetry::pipeline::{record_stage, record_stage_outcome, start_artifact_span};

/// One worker attached to one artifact-type queue. Runs until shutdown.
pub(crate) async fn run(inner: Arc<EngineInner>, artifact_type: ArtifactType, index: usize) {
    let queue = artifact_type.queue_name();
    info!(queue, worker = index, "worker started");

    while !inner.stopping() {
        match inner.broker.pop(queue, inner.config.pop_timeout).await {
            Ok(Some(entry)) => {
                if let Err(err) = process_entry(&inner, entry).await {
                    error!(queue, worker = index, "dispatch failed: {err}");
                }
            }
            Ok(None) => {} // timed out empty; loop re-checks shutdown
            Err(err) => {
                error!(queue, worker = index, "queue pop failed: {err}");
                tokio::time::sleep(inner.config.pop_timeout).await;
            }
        }
    }

    info!(queue, worker = index, "worker stopped");
}

/// Dispatch one claimed entry. Errors out of here are orchestration
/// failures (storage, queue); handler failures never escape, they become
/// retry or dead-letter decisions.
pub(crate) async fn process_entry(inner: &EngineInner, entry: QueueEntry) -> Result<()> {
    let artifact = match inner.db.get_artifact(entry.artifact_id).await {
        Ok(artifact) => artifact,
        Err(Error::NotFound(_)) => {
            warn!(artifact = %entry.artifact_id, "dropping entry for missing artifact");
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    if artifact.status.is_terminal() {
        warn!(
            artifact = %artifact.id,
            status = %artifact.status,
            "dropping stale entry for terminal artifact"
        );
        return Ok(());
    }

    let sequence = inner
        .registry
        .sequence(artifact.artifact_type)
        .ok_or_else(|| {
            Error::Config(format!(
                "no stage sequence for artifact type {}",
                artifact.artifact_type
            ))
        })?;

    let span = start_artifact_span(artifact.artifact_type.as_str(), &artifact.id.0);
    run_chain(inner, entry, artifact, &sequence)
        .instrument(span)
        .await
}

async fn run_chain(
    inner: &EngineInner,
    mut entry: QueueEntry,
    mut artifact: Artifact,
    sequence: &StageSequence,
) -> Result<()> {
    let Some(resume) = sequence.resume_point(&artifact.stage_timings) else {
        // Every stage already has a timing: a previous dispatch finished
        // the chain but not the completion write.
        inner.cache.invalidate_status(artifact.job_id, Some(artifact.id)).await;
        if artifact.status == ArtifactStatus::Processing
            && inner.db.complete_artifact(artifact.id, Utc::now()).await?
        {
            artifact.status = ArtifactStatus::Completed;
            inner.bus.emit_lossy(StatusEvent::artifact(&artifact)).await;
            completion::recompute_job(inner, artifact.job_id).await?;
        } else {
            warn!(artifact = %artifact.id, "entry with fully timed chain dropped");
        }
        return Ok(());
    };
    let resume = resume.to_string();

    inner.cache.invalidate_status(artifact.job_id, Some(artifact.id)).await;
    if !inner
        .db
        .mark_artifact_processing(artifact.id, &resume, Utc::now())
        .await?
    {
        warn!(artifact = %artifact.id, "artifact no longer claimable, dropping entry");
        return Ok(());
    }
    artifact.status = ArtifactStatus::Processing;
    artifact.current_stage = Some(resume.clone());

    if inner.db.mark_job_started(artifact.job_id, Utc::now()).await? {
        completion::publish_job_event(inner, artifact.job_id).await?;
    }
    inner.bus.emit_lossy(StatusEvent::artifact(&artifact)).await;

    let span = tracing::Span::current();
    for stage in sequence.stages_from(&resume) {
        let stage = stage.as_str();
        if stage != resume {
            inner.cache.invalidate_status(artifact.job_id, Some(artifact.id)).await;
            if !inner.db.set_current_stage(artifact.id, stage, Utc::now()).await? {
                warn!(
                    artifact = %artifact.id,
                    stage,
                    "artifact left PROCESSING mid-chain, abandoning dispatch"
                );
                return Ok(());
            }
            artifact.current_stage = Some(stage.to_string());
            inner.bus.emit_lossy(StatusEvent::artifact(&artifact)).await;
        }
        record_stage(&span, stage);

        let Some(handler) = inner.handlers.get(stage) else {
            // A configuration hole, not a transient fault; retrying cannot
            // produce a handler. Straight to the dead-letter store.
            let message = format!("no handler registered for stage '{stage}'");
            error!(artifact = %artifact.id, stage, "{message}");
            let now = Utc::now();
            let retry_count = inner.db.record_artifact_failure(artifact.id, &message, now).await?;
            note_failure(&mut entry, &mut artifact, retry_count, &message, now);
            return quarantine(inner, entry, artifact).await;
        };

        let request = StageRequest {
            job_id: artifact.job_id,
            artifact_id: artifact.id,
            artifact_type: artifact.artifact_type,
            filename: artifact.filename.clone(),
            source_ref: artifact.source_ref.clone(),
            stage: stage.to_string(),
            options: artifact.options.clone(),
        };

        let started = Instant::now();
        let outcome = handler.run(&request).await;
        let seconds = started.elapsed().as_secs_f64();

        match outcome {
            Ok(StageOutcome::Advance { .. }) => {
                record_stage_outcome(&span, stage, "ok");
                record_stage_duration(&artifact, stage, "ok", seconds);
                inner.db.record_stage_timing(artifact.id, stage, seconds, Utc::now()).await?;
                artifact.stage_timings.entry(stage.to_string()).or_insert(seconds);
                inner.cache.invalidate_status(artifact.job_id, Some(artifact.id)).await;
                inner.bus.emit_lossy(StatusEvent::artifact(&artifact)).await;
            }
            Ok(StageOutcome::Deferred) => {
                record_stage_outcome(&span, stage, "deferred");
                record_stage_duration(&artifact, stage, "deferred", seconds);
                // The local half of the shared stage ran to completion;
                // its duration is recorded like any finished stage so a
                // later redelivery resumes past it.
                inner.db.record_stage_timing(artifact.id, stage, seconds, Utc::now()).await?;
                artifact.stage_timings.entry(stage.to_string()).or_insert(seconds);
                inner.cache.invalidate_status(artifact.job_id, Some(artifact.id)).await;
                if inner.db.park_awaiting_downstream(artifact.id, Utc::now()).await? {
                    artifact.status = ArtifactStatus::AwaitingDownstream;
                    inner.bus.emit_lossy(StatusEvent::artifact(&artifact)).await;
                }
                // Not terminal: the job recount waits for the downstream
                // completion call.
                return Ok(());
            }
            Err(err) => {
                record_stage_outcome(&span, stage, "error");
                record_stage_duration(&artifact, stage, "error", seconds);
                return handle_failure(inner, entry, artifact, stage, err).await;
            }
        }
    }

    // Full local chain done.
    inner.cache.invalidate_status(artifact.job_id, Some(artifact.id)).await;
    if inner.db.complete_artifact(artifact.id, Utc::now()).await? {
        artifact.status = ArtifactStatus::Completed;
        inner.bus.emit_lossy(StatusEvent::artifact(&artifact)).await;
        completion::recompute_job(inner, artifact.job_id).await?;
    }
    Ok(())
}

/// Classify a handler failure: park for retry while budget remains,
/// otherwise dead-letter.
async fn handle_failure(
    inner: &EngineInner,
    mut entry: QueueEntry,
    mut artifact: Artifact,
    stage: &str,
    err: Error,
) -> Result<()> {
    let now = Utc::now();
    let message = err.to_string();
    warn!(
        artifact = %artifact.id,
        stage,
        retry_count = artifact.retry_count + 1,
        "stage handler failed: {message}"
    );

    inner.cache.invalidate_status(artifact.job_id, Some(artifact.id)).await;
    let retry_count = inner.db.record_artifact_failure(artifact.id, &message, now).await?;
    note_failure(&mut entry, &mut artifact, retry_count, &message, now);

    if retry_count <= inner.config.max_retries {
        let delay = backoff_delay(inner.config.backoff_base, inner.config.backoff_cap, retry_count);
        let eligible_at = now + ChronoDuration::milliseconds(delay.as_millis() as i64);
        metrics::retries_scheduled().add(1, &[KeyValue::new("queue", entry.queue.clone())]);
        info!(
            artifact = %artifact.id,
            stage,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            "scheduling retry"
        );
        inner.broker.schedule_at(entry, eligible_at).await?;
        // The artifact stays PROCESSING through the backoff window.
        inner.bus.emit_lossy(StatusEvent::artifact(&artifact)).await;
        Ok(())
    } else {
        quarantine(inner, entry, artifact).await
    }
}

/// Retry budget exhausted (or unresolvable configuration): entry to the
/// dead-letter store, artifact to FAILED, job recounted.
async fn quarantine(inner: &EngineInner, entry: QueueEntry, mut artifact: Artifact) -> Result<()> {
    let now = Utc::now();
    warn!(
        artifact = %artifact.id,
        queue = %entry.queue,
        failures = entry.retry_count,
        "dead-lettering artifact"
    );

    inner.broker.dead_letter(entry, now).await?;
    inner.cache.invalidate_status(artifact.job_id, Some(artifact.id)).await;
    if inner.db.fail_artifact(artifact.id, now).await? {
        artifact.status = ArtifactStatus::Failed;
        inner.bus.emit_lossy(StatusEvent::artifact(&artifact)).await;
        completion::recompute_job(inner, artifact.job_id).await?;
    }
    Ok(())
}

fn note_failure(
    entry: &mut QueueEntry,
    artifact: &mut Artifact,
    retry_count: u32,
    message: &str,
    now: DateTime<Utc>,
) {
    entry.retry_count = retry_count;
    entry.first_failed_at.get_or_insert(now);
    entry.last_error = Some(message.to_string());
    artifact.retry_count = retry_count;
    artifact.last_error = Some(message.to_string());
}

fn record_stage_duration(artifact: &Artifact, stage: &str, result: &'static str, seconds: f64) {
    metrics::stage_duration_seconds().record(
        seconds,
        &[
            KeyValue::new("artifact_type", artifact.artifact_type.as_str()),
            KeyValue::new("stage", stage.to_string()),
            KeyValue::new("result", result),
        ],
    );
}

/// `base * 2^retry_count`, saturating, capped.
pub(crate) fn backoff_delay(base: Duration, cap: Duration, retry_count: u32) -> Duration {
    let factor = 1u32.checked_shl(retry_count.min(16)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_retry() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(600);
        assert_eq!(backoff_delay(base, cap, 1), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, cap, 2), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, cap, 3), Duration::from_secs(16));
    }

    #[test]
    fn backoff_is_capped() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(30);
        assert_eq!(backoff_delay(base, cap, 10), Duration::from_secs(30));
        // Shift counts far past any plausible budget still saturate.
        assert_eq!(backoff_delay(base, cap, 40), Duration::from_secs(30));
    }
}
