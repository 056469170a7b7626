//! Artifact rows: lookup, lifecycle transitions, stage-timing bookkeeping,
//! and retry accounting.
//!
//! Transitions are conditional updates; an affected-row count of zero means
//! the artifact was not in the expected status. Worker-path operations
//! report that quietly (stale redeliveries are normal under at-least-once
//! dispatch); boundary operations fail loudly.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;

use super::{parse_opt_ts, parse_ts, parse_uuid, ts};
use crate::error::{Error, Result};
use crate::model::{Artifact, ArtifactId, ArtifactStatus, JobId};
use crate::telemetry::metrics;

impl super::Db {
    /// Get an artifact by ID.
    pub async fn get_artifact(&self, id: ArtifactId) -> Result<Artifact> {
        let row: Option<ArtifactRow> = sqlx::query_as(
            "SELECT id, job_id, artifact_type, filename, source_ref, options, status,
                    current_stage, stage_timings, retry_count, last_error,
                    created_at, updated_at, completed_at
             FROM artifacts WHERE id = ?",
        )
        .bind(id.0.to_string())
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("artifact {id}")))?
            .try_into_artifact()
    }

    /// All artifacts of a job, in submission order.
    pub async fn list_artifacts(&self, job_id: JobId) -> Result<Vec<Artifact>> {
        let rows: Vec<ArtifactRow> = sqlx::query_as(
            "SELECT id, job_id, artifact_type, filename, source_ref, options, status,
                    current_stage, stage_timings, retry_count, last_error,
                    created_at, updated_at, completed_at
             FROM artifacts WHERE job_id = ? ORDER BY position",
        )
        .bind(job_id.0.to_string())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(|r| r.try_into_artifact()).collect()
    }

    /// Claim the artifact for a worker: QUEUED becomes PROCESSING at the
    /// given resume stage. Re-claiming an artifact already PROCESSING (a
    /// retry redelivery) just moves its current stage. Returns false when
    /// the artifact is terminal — the entry is stale and should be dropped.
    pub async fn mark_artifact_processing(
        &self,
        id: ArtifactId,
        stage: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE artifacts SET status = 'processing', current_stage = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'queued'",
        )
        .bind(stage)
        .bind(ts(now))
        .bind(id.0.to_string())
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected > 0 {
            record_artifact_transition(ArtifactStatus::Queued, ArtifactStatus::Processing);
            return Ok(true);
        }

        let rows_affected = sqlx::query(
            "UPDATE artifacts SET current_stage = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'processing'",
        )
        .bind(stage)
        .bind(ts(now))
        .bind(id.0.to_string())
        .execute(self.pool())
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    /// Advance the current stage mid-chain. Returns false if the artifact is
    /// no longer PROCESSING.
    pub async fn set_current_stage(
        &self,
        id: ArtifactId,
        stage: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE artifacts SET current_stage = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'processing'",
        )
        .bind(stage)
        .bind(ts(now))
        .bind(id.0.to_string())
        .execute(self.pool())
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    /// Record a stage duration. First write wins: the timing map is
    /// append-only and a stage that already has a duration keeps it, so a
    /// redelivered chain treats it as done.
    pub async fn record_stage_timing(
        &self,
        id: ArtifactId,
        stage: &str,
        seconds: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        let row: Option<(String,)> =
            sqlx::query_as("SELECT stage_timings FROM artifacts WHERE id = ?")
                .bind(id.0.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        let (timings,) = row.ok_or_else(|| Error::NotFound(format!("artifact {id}")))?;

        let mut map: BTreeMap<String, f64> = serde_json::from_str(&timings)?;
        if !map.contains_key(stage) {
            map.insert(stage.to_string(), seconds);
            sqlx::query("UPDATE artifacts SET stage_timings = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(serde_json::to_string(&map)?)
                .bind(ts(now))
                .bind(id.0.to_string())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// PROCESSING becomes COMPLETED after the full local chain (and no
    /// shared downstream pending).
    pub async fn complete_artifact(&self, id: ArtifactId, now: DateTime<Utc>) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE artifacts SET status = 'completed', completed_at = ?1, updated_at = ?1
             WHERE id = ?2 AND status = 'processing'",
        )
        .bind(ts(now))
        .bind(id.0.to_string())
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected > 0 {
            record_artifact_transition(ArtifactStatus::Processing, ArtifactStatus::Completed);
        }
        Ok(rows_affected > 0)
    }

    /// Park the artifact: local chain done, shared downstream stage still
    /// owed. Deliberately not COMPLETED.
    pub async fn park_awaiting_downstream(
        &self,
        id: ArtifactId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE artifacts SET status = 'awaiting_downstream', updated_at = ?1
             WHERE id = ?2 AND status = 'processing'",
        )
        .bind(ts(now))
        .bind(id.0.to_string())
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected > 0 {
            record_artifact_transition(
                ArtifactStatus::Processing,
                ArtifactStatus::AwaitingDownstream,
            );
        }
        Ok(rows_affected > 0)
    }

    /// The downstream collaborator finished its shared stage for this
    /// artifact: AWAITING_DOWNSTREAM becomes COMPLETED. Boundary operation,
    /// fails loudly on a wrong status.
    pub async fn complete_downstream_artifact(
        &self,
        id: ArtifactId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE artifacts SET status = 'completed', completed_at = ?1, updated_at = ?1
             WHERE id = ?2 AND status = 'awaiting_downstream'",
        )
        .bind(ts(now))
        .bind(id.0.to_string())
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            let artifact = self.get_artifact(id).await?;
            validate_transition(artifact.status, ArtifactStatus::Completed)?;
            // The table allows PROCESSING -> COMPLETED in general, but this
            // boundary only owns the parked-to-completed hop.
            return Err(Error::InvalidTransition {
                from: artifact.status.to_string(),
                to: ArtifactStatus::Completed.to_string(),
            });
        }
        record_artifact_transition(ArtifactStatus::AwaitingDownstream, ArtifactStatus::Completed);
        Ok(())
    }

    /// Record a handler failure and return the new retry count. The artifact
    /// stays PROCESSING; whether it retries or dead-letters is the caller's
    /// decision based on the returned count.
    pub async fn record_artifact_failure(
        &self,
        id: ArtifactId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE artifacts SET retry_count = retry_count + 1, last_error = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'processing'
             RETURNING retry_count",
        )
        .bind(error)
        .bind(ts(now))
        .bind(id.0.to_string())
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some((count,)) => Ok(count as u32),
            None => Err(Error::Other(format!(
                "artifact {id} is not processing; failure not recorded"
            ))),
        }
    }

    /// PROCESSING becomes FAILED once the retry budget is exhausted.
    pub async fn fail_artifact(&self, id: ArtifactId, now: DateTime<Utc>) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE artifacts SET status = 'failed', updated_at = ?1
             WHERE id = ?2 AND status = 'processing'",
        )
        .bind(ts(now))
        .bind(id.0.to_string())
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected > 0 {
            record_artifact_transition(ArtifactStatus::Processing, ArtifactStatus::Failed);
        }
        Ok(rows_affected > 0)
    }

    /// Operator replay: FAILED returns to QUEUED with a fresh retry budget.
    pub async fn replay_artifact(&self, id: ArtifactId, now: DateTime<Utc>) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE artifacts SET status = 'queued', retry_count = 0, updated_at = ?1
             WHERE id = ?2 AND status = 'failed'",
        )
        .bind(ts(now))
        .bind(id.0.to_string())
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            let artifact = self.get_artifact(id).await?;
            validate_transition(artifact.status, ArtifactStatus::Queued)?;
            return Err(Error::InvalidTransition {
                from: artifact.status.to_string(),
                to: ArtifactStatus::Queued.to_string(),
            });
        }
        record_artifact_transition(ArtifactStatus::Failed, ArtifactStatus::Queued);
        Ok(())
    }

    /// Artifacts stuck QUEUED since before the cutoff — the enqueue was
    /// lost (or never happened). Reconciliation sweep input.
    pub async fn list_orphaned_artifacts(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Artifact>> {
        let rows: Vec<ArtifactRow> = sqlx::query_as(
            "SELECT id, job_id, artifact_type, filename, source_ref, options, status,
                    current_stage, stage_timings, retry_count, last_error,
                    created_at, updated_at, completed_at
             FROM artifacts
             WHERE status = 'queued' AND updated_at <= ?
             ORDER BY updated_at LIMIT ?",
        )
        .bind(ts(cutoff))
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(|r| r.try_into_artifact()).collect()
    }
}

/// Validate a status transition, returning an error if disallowed.
fn validate_transition(from: ArtifactStatus, to: ArtifactStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

fn record_artifact_transition(from: ArtifactStatus, to: ArtifactStatus) {
    metrics::state_transitions().add(
        1,
        &[
            KeyValue::new("entity", "artifact"),
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct ArtifactRow {
    id: String,
    job_id: String,
    artifact_type: String,
    filename: String,
    source_ref: String,
    options: String,
    status: String,
    current_stage: Option<String>,
    stage_timings: String,
    retry_count: i64,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl ArtifactRow {
    fn try_into_artifact(self) -> Result<Artifact> {
        Ok(Artifact {
            id: ArtifactId(parse_uuid(&self.id)?),
            job_id: JobId(parse_uuid(&self.job_id)?),
            artifact_type: self.artifact_type.parse()?,
            filename: self.filename,
            source_ref: self.source_ref,
            options: serde_json::from_str(&self.options)?,
            status: self.status.parse()?,
            current_stage: self.current_stage,
            stage_timings: serde_json::from_str(&self.stage_timings)?,
            retry_count: self.retry_count as u32,
            last_error: self.last_error,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            completed_at: parse_opt_ts(self.completed_at.as_deref())?,
        })
    }
}
