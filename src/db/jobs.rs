//! Job rows: submission insert, lookup, listing, lifecycle stamps, and the
//! conditional status flips the completion aggregator relies on.

use opentelemetry::KeyValue;

use super::{parse_opt_ts, parse_ts, parse_uuid, ts};
use crate::error::{Error, Result};
use crate::model::{Artifact, Job, JobId, JobStatus};
use crate::telemetry::metrics;

/// Authoritative per-status counts for one job's artifacts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArtifactCounts {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
}

impl ArtifactCounts {
    pub fn terminal(&self) -> u32 {
        self.completed + self.failed
    }
}

impl super::Db {
    /// Insert the job row and every artifact row in one transaction. The
    /// enqueue that follows is deliberately outside it; an artifact whose
    /// enqueue is lost stays QUEUED and the reconciliation sweep finds it.
    pub async fn insert_submission(&self, job: &Job, artifacts: &[Artifact]) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "INSERT INTO jobs (id, case_label, parent_id, status, total_files, archived, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.id.0.to_string())
        .bind(&job.case_label)
        .bind(job.parent_id.map(|p| p.0.to_string()))
        .bind(job.status.as_str())
        .bind(job.total_files as i64)
        .bind(job.archived)
        .bind(ts(job.created_at))
        .execute(&mut *tx)
        .await?;

        for (position, artifact) in artifacts.iter().enumerate() {
            sqlx::query(
                "INSERT INTO artifacts (id, job_id, position, artifact_type, filename,
                                        source_ref, options, status, stage_timings,
                                        created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(artifact.id.0.to_string())
            .bind(artifact.job_id.0.to_string())
            .bind(position as i64)
            .bind(artifact.artifact_type.as_str())
            .bind(&artifact.filename)
            .bind(&artifact.source_ref)
            .bind(serde_json::to_string(&artifact.options)?)
            .bind(artifact.status.as_str())
            .bind(serde_json::to_string(&artifact.stage_timings)?)
            .bind(ts(artifact.created_at))
            .bind(ts(artifact.updated_at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Get a job by ID.
    pub async fn get_job(&self, id: JobId) -> Result<Job> {
        let row: Option<JobRow> = sqlx::query_as(
            "SELECT id, case_label, parent_id, status, total_files, archived,
                    created_at, started_at, completed_at
             FROM jobs WHERE id = ?",
        )
        .bind(id.0.to_string())
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("job {id}")))?
            .try_into_job()
    }

    /// List jobs, newest first. Archived jobs are excluded unless asked for.
    pub async fn list_jobs(
        &self,
        case_label: Option<&str>,
        include_archived: bool,
        limit: u32,
    ) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT id, case_label, parent_id, status, total_files, archived,
                    created_at, started_at, completed_at
             FROM jobs
             WHERE (?1 IS NULL OR case_label = ?1) AND (?2 OR archived = 0)
             ORDER BY created_at DESC
             LIMIT ?3",
        )
        .bind(case_label)
        .bind(include_archived)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(|r| r.try_into_job()).collect()
    }

    /// Stamp the job PROCESSING when its first artifact starts. Idempotent:
    /// returns whether this call flipped it.
    pub async fn mark_job_started(&self, id: JobId, now: chrono::DateTime<chrono::Utc>) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE jobs SET status = 'processing', started_at = COALESCE(started_at, ?1)
             WHERE id = ?2 AND status = 'queued'",
        )
        .bind(ts(now))
        .bind(id.0.to_string())
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected > 0 {
            record_job_transition(JobStatus::Queued, JobStatus::Processing);
        }
        Ok(rows_affected > 0)
    }

    /// Return a FAILED job to PROCESSING when one of its dead-lettered
    /// artifacts is replayed.
    pub async fn mark_job_reprocessing(
        &self,
        id: JobId,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE jobs SET status = 'processing', completed_at = NULL,
                             started_at = COALESCE(started_at, ?1)
             WHERE id = ?2 AND status = 'failed'",
        )
        .bind(ts(now))
        .bind(id.0.to_string())
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected > 0 {
            record_job_transition(JobStatus::Failed, JobStatus::Processing);
        }
        Ok(rows_affected > 0)
    }

    /// Flip the job COMPLETED iff every artifact is COMPLETED. The recount
    /// lives inside the statement, so two artifacts finishing concurrently
    /// cannot both miss the flip or double-fire it.
    pub async fn try_complete_job(
        &self,
        id: JobId,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE jobs SET status = 'completed', completed_at = ?1,
                             started_at = COALESCE(started_at, ?1)
             WHERE id = ?2 AND status IN ('queued', 'processing')
               AND (SELECT COUNT(*) FROM artifacts
                    WHERE job_id = ?2 AND status = 'completed') = total_files",
        )
        .bind(ts(now))
        .bind(id.0.to_string())
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected > 0 {
            record_job_transition(JobStatus::Processing, JobStatus::Completed);
        }
        Ok(rows_affected > 0)
    }

    /// Flip the job FAILED once all artifacts are terminal and at least one
    /// FAILED. Artifacts parked AWAITING_DOWNSTREAM hold this off: they are
    /// not terminal.
    pub async fn try_fail_job(&self, id: JobId, now: chrono::DateTime<chrono::Utc>) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE jobs SET status = 'failed', completed_at = ?1,
                             started_at = COALESCE(started_at, ?1)
             WHERE id = ?2 AND status IN ('queued', 'processing')
               AND (SELECT COUNT(*) FROM artifacts
                    WHERE job_id = ?2 AND status IN ('completed', 'failed')) = total_files
               AND EXISTS (SELECT 1 FROM artifacts
                           WHERE job_id = ?2 AND status = 'failed')",
        )
        .bind(ts(now))
        .bind(id.0.to_string())
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected > 0 {
            record_job_transition(JobStatus::Processing, JobStatus::Failed);
        }
        Ok(rows_affected > 0)
    }

    /// Authoritative per-status counts for a job's artifacts.
    pub async fn artifact_counts(&self, id: JobId) -> Result<ArtifactCounts> {
        let (total, completed, failed): (i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*),
                    COALESCE(SUM(status = 'completed'), 0),
                    COALESCE(SUM(status = 'failed'), 0)
             FROM artifacts WHERE job_id = ?",
        )
        .bind(id.0.to_string())
        .fetch_one(self.pool())
        .await?;

        Ok(ArtifactCounts {
            total: total as u32,
            completed: completed as u32,
            failed: failed as u32,
        })
    }

    /// Hide a job from listings. Jobs are never deleted.
    pub async fn archive_job(&self, id: JobId) -> Result<()> {
        let rows_affected = sqlx::query("UPDATE jobs SET archived = 1 WHERE id = ?")
            .bind(id.0.to_string())
            .execute(self.pool())
            .await?
            .rows_affected();

        if rows_affected == 0 {
            return Err(Error::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    /// Jobs not yet terminal, oldest first — reconciliation sweep input.
    pub async fn list_unfinished_jobs(&self, limit: u32) -> Result<Vec<JobId>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM jobs WHERE status IN ('queued', 'processing')
             ORDER BY created_at LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|(id,)| Ok(JobId(parse_uuid(id)?)))
            .collect()
    }
}

fn record_job_transition(from: JobStatus, to: JobStatus) {
    metrics::state_transitions().add(
        1,
        &[
            KeyValue::new("entity", "job"),
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    case_label: Option<String>,
    parent_id: Option<String>,
    status: String,
    total_files: i64,
    archived: bool,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(parse_uuid(&self.id)?),
            case_label: self.case_label,
            parent_id: self
                .parent_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?
                .map(JobId),
            status: self.status.parse()?,
            total_files: self.total_files as u32,
            archived: self.archived,
            created_at: parse_ts(&self.created_at)?,
            started_at: parse_opt_ts(self.started_at.as_deref())?,
            completed_at: parse_opt_ts(self.completed_at.as_deref())?,
        })
    }
}
