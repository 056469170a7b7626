//! Authoritative status reads with a cache in front.
//!
//! Every view is assembled from database rows; the cache only short-cuts
//! repeat polls inside the TTL window. Progress is positional: the ordinal
//! of the current stage over the declared sequence length, so it never
//! moves backwards while an artifact resumes after a retry.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::{artifact_status_key, job_status_key, StatusCache};
use crate::db::Db;
use crate::error::Result;
use crate::model::{Artifact, ArtifactId, ArtifactStatus, ArtifactType, JobId, JobStatus};
use crate::registry::StageRegistry;

/// Per-artifact slice of the status boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactStatusView {
    pub artifact_id: ArtifactId,
    pub filename: String,
    pub artifact_type: ArtifactType,
    pub status: ArtifactStatus,
    pub current_stage: Option<String>,
    pub progress_percentage: f64,
    pub stage_timings: BTreeMap<String, f64>,
    pub retry_count: u32,
    pub error_message: Option<String>,
}

/// Aggregate job view handed to pollers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub case_label: Option<String>,
    pub status: JobStatus,
    pub total_files: u32,
    pub processed_files: u32,
    pub progress_percentage: f64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub artifacts: Vec<ArtifactStatusView>,
}

/// Read side shared by the engine facade and the CLI.
pub struct StatusReader {
    db: Arc<Db>,
    cache: Arc<StatusCache>,
    registry: Arc<StageRegistry>,
}

impl StatusReader {
    pub fn new(db: Arc<Db>, cache: Arc<StatusCache>, registry: Arc<StageRegistry>) -> Self {
        Self { db, cache, registry }
    }

    /// Full job view: cached within the status TTL, otherwise recomputed
    /// from rows and re-cached.
    pub async fn job_status(&self, job_id: JobId) -> Result<JobStatusView> {
        let key = job_status_key(job_id);
        if let Some(cached) = self.cache.get(&key).await {
            match serde_json::from_value(cached) {
                Ok(view) => return Ok(view),
                Err(err) => {
                    // Shape drift after an upgrade; fall through to rows.
                    warn!(job_id = %job_id, "discarding undecodable cached status: {err}");
                    self.cache.invalidate(&key).await;
                }
            }
        }

        let view = self.load_job_status(job_id).await?;
        self.cache.set(key, serde_json::to_value(&view)?).await;
        Ok(view)
    }

    /// Single-artifact view, cached under its own key.
    pub async fn artifact_status(&self, artifact_id: ArtifactId) -> Result<ArtifactStatusView> {
        let key = artifact_status_key(artifact_id);
        if let Some(cached) = self.cache.get(&key).await {
            match serde_json::from_value(cached) {
                Ok(view) => return Ok(view),
                Err(err) => {
                    warn!(artifact_id = %artifact_id, "discarding undecodable cached status: {err}");
                    self.cache.invalidate(&key).await;
                }
            }
        }

        let artifact = self.db.get_artifact(artifact_id).await?;
        let view = self.artifact_view(&artifact);
        self.cache.set(key, serde_json::to_value(&view)?).await;
        Ok(view)
    }

    async fn load_job_status(&self, job_id: JobId) -> Result<JobStatusView> {
        let job = self.db.get_job(job_id).await?;
        let rows = self.db.list_artifacts(job_id).await?;

        let views: Vec<ArtifactStatusView> = rows.iter().map(|a| self.artifact_view(a)).collect();
        let processed_files = rows
            .iter()
            .filter(|a| a.status == ArtifactStatus::Completed)
            .count() as u32;
        let progress_percentage = if views.is_empty() {
            0.0
        } else {
            views.iter().map(|v| v.progress_percentage).sum::<f64>() / views.len() as f64
        };

        Ok(JobStatusView {
            job_id: job.id,
            case_label: job.case_label,
            status: job.status,
            total_files: job.total_files,
            processed_files,
            progress_percentage,
            created_at: job.created_at,
            completed_at: job.completed_at,
            artifacts: views,
        })
    }

    fn artifact_view(&self, artifact: &Artifact) -> ArtifactStatusView {
        ArtifactStatusView {
            artifact_id: artifact.id,
            filename: artifact.filename.clone(),
            artifact_type: artifact.artifact_type,
            status: artifact.status,
            current_stage: artifact.current_stage.clone(),
            progress_percentage: self.artifact_progress(artifact),
            stage_timings: artifact.stage_timings.clone(),
            retry_count: artifact.retry_count,
            error_message: artifact.last_error.clone(),
        }
    }

    /// Positional progress in [0,100]. Completed pins to 100 even if the
    /// stage list shrank since the run. A fresh queued artifact sits at 0;
    /// a replayed one reports the resume point its recorded timings imply,
    /// so progress never slides back when a dead letter returns to QUEUED.
    fn artifact_progress(&self, artifact: &Artifact) -> f64 {
        match artifact.status {
            ArtifactStatus::Completed => 100.0,
            ArtifactStatus::Queued if artifact.stage_timings.is_empty() => 0.0,
            ArtifactStatus::Queued => self
                .registry
                .sequence(artifact.artifact_type)
                .map(|seq| match seq.resume_point(&artifact.stage_timings) {
                    Some(stage) => seq.progress_percent(Some(stage)),
                    None => 100.0,
                })
                .unwrap_or(0.0),
            _ => self
                .registry
                .sequence(artifact.artifact_type)
                .map(|seq| seq.progress_percent(artifact.current_stage.as_deref()))
                .unwrap_or(0.0),
        }
    }
}
