//! Core data model.
//!
//! A job groups one or more artifacts submitted together. Each artifact moves
//! through the ordered stage pipeline for its type; the job's aggregate status
//! is derived from its artifacts, never stored ahead of them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A submission grouping one or more artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier.
    pub id: JobId,

    /// Optional grouping key. Submissions for the same case share a label.
    pub case_label: Option<String>,

    /// Parent job, when this submission adds artifacts to an existing case.
    pub parent_id: Option<JobId>,

    /// Aggregate lifecycle status, derived from the owned artifacts.
    pub status: JobStatus,

    /// Number of artifacts submitted with this job. Fixed at submission time.
    pub total_files: u32,

    /// Archived jobs are hidden from listings but never deleted.
    pub archived: bool,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted, no artifact has started processing yet.
    Queued,
    /// At least one artifact is being processed or awaiting retry.
    Processing,
    /// Every owned artifact completed.
    Completed,
    /// All artifacts terminal, at least one failed.
    Failed,
}

impl JobStatus {
    /// Can transition from self to `to`? Job flips are enforced by the
    /// conditional updates in `db::jobs`; this table documents the legal
    /// edges for the tests that pin them.
    #[cfg(test)]
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Queued, Processing)
                | (Queued, Completed)   // single-artifact job finishing before the stamp
                | (Queued, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Processing)  // dead-letter replay
        )
    }

    /// Is this a terminal status?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(crate::error::Error::Other(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// One uploaded unit of work belonging to a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Unique identifier.
    pub id: ArtifactId,

    /// Owning job.
    pub job_id: JobId,

    /// Determines the stage sequence and the work queue this artifact rides.
    pub artifact_type: ArtifactType,

    /// Display name, as submitted.
    pub filename: String,

    /// Opaque storage reference handed to stage handlers. The engine never
    /// dereferences it.
    pub source_ref: String,

    /// Per-type options (e.g. source language). Opaque to the engine.
    pub options: serde_json::Value,

    /// Current lifecycle status.
    pub status: ArtifactStatus,

    /// Stage currently executing (or the one that failed). Must belong to
    /// the declared sequence for `artifact_type`.
    pub current_stage: Option<String>,

    /// Wall-clock seconds per completed stage. Append-only: entries are
    /// never removed or reset, so a retry resumes at the first untimed stage.
    pub stage_timings: BTreeMap<String, f64>,

    /// Failures so far for the current dispatch. Reset to zero on
    /// dead-letter replay.
    pub retry_count: u32,

    /// Most recent handler error, kept after retries succeed it.
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Newtype for artifact IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactId(pub Uuid);

impl ArtifactId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for ArtifactId {
    fn default() -> Self {
        Self::new()
    }
}

/// The four artifact families the engine routes. One work queue per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Document,
    Audio,
    Video,
    Cdr,
}

impl ArtifactType {
    pub const ALL: [ArtifactType; 4] = [
        ArtifactType::Document,
        ArtifactType::Audio,
        ArtifactType::Video,
        ArtifactType::Cdr,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactType::Document => "document",
            ArtifactType::Audio => "audio",
            ArtifactType::Video => "video",
            ArtifactType::Cdr => "cdr",
        }
    }

    /// Name of the work queue artifacts of this type ride.
    pub fn queue_name(self) -> &'static str {
        self.as_str()
    }
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ArtifactType {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "document" => Ok(ArtifactType::Document),
            "audio" => Ok(ArtifactType::Audio),
            "video" => Ok(ArtifactType::Video),
            "cdr" => Ok(ArtifactType::Cdr),
            other => Err(crate::error::Error::UnknownArtifactType(other.to_string())),
        }
    }
}

/// Lifecycle status of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    /// Row exists, waiting for a worker.
    Queued,
    /// A worker is running the stage chain. Covers backoff waits between
    /// retries; those are invisible beyond this status.
    Processing,
    /// Local chain finished but a shared downstream stage has not covered
    /// this artifact yet. Not terminal, and not COMPLETED.
    AwaitingDownstream,
    /// Every stage ran, including any shared downstream stage.
    Completed,
    /// Retry budget exhausted. Terminal until an operator replays it.
    Failed,
}

impl ArtifactStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: ArtifactStatus) -> bool {
        use ArtifactStatus::*;
        matches!(
            (self, to),
            (Queued, Processing)
                | (Processing, Completed)
                | (Processing, AwaitingDownstream)
                | (Processing, Failed)
                | (AwaitingDownstream, Completed) // downstream stage finished
                | (Failed, Queued) // operator replay
        )
    }

    /// Terminal for completion accounting. AWAITING_DOWNSTREAM is not
    /// terminal: the job must not complete while any artifact sits there.
    pub fn is_terminal(self) -> bool {
        matches!(self, ArtifactStatus::Completed | ArtifactStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactStatus::Queued => "queued",
            ArtifactStatus::Processing => "processing",
            ArtifactStatus::AwaitingDownstream => "awaiting_downstream",
            ArtifactStatus::Completed => "completed",
            ArtifactStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ArtifactStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(ArtifactStatus::Queued),
            "processing" => Ok(ArtifactStatus::Processing),
            "awaiting_downstream" => Ok(ArtifactStatus::AwaitingDownstream),
            "completed" => Ok(ArtifactStatus::Completed),
            "failed" => Ok(ArtifactStatus::Failed),
            other => Err(crate::error::Error::Other(format!(
                "unknown artifact status: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue Entry
// ---------------------------------------------------------------------------

/// The payload that rides the broker. An entry lives in exactly one of the
/// work queue, the retry schedule, or the dead-letter store at any moment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub artifact_id: ArtifactId,

    /// Target queue name (the artifact type's queue).
    pub queue: String,

    /// Failures so far. Incremented by the worker at failure time, before
    /// the entry reaches the retry schedule. Reset to zero on replay.
    pub retry_count: u32,

    /// When the first failure happened, if any. Travels with the entry so
    /// the dead-letter record can report the full failure window.
    pub first_failed_at: Option<DateTime<Utc>>,

    /// Most recent handler error, if any.
    pub last_error: Option<String>,
}

impl QueueEntry {
    pub fn new(job_id: JobId, artifact_id: ArtifactId, queue: impl Into<String>) -> Self {
        Self {
            job_id,
            artifact_id,
            queue: queue.into(),
            retry_count: 0,
            first_failed_at: None,
            last_error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Dead Letter
// ---------------------------------------------------------------------------

/// A queue entry that exhausted its retry budget, plus the diagnostics an
/// operator needs to decide between replay and purge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Broker-assigned handle used by the replay/purge operations.
    pub seq: i64,

    /// Queue the entry originally rode, and the one replay targets.
    pub queue: String,

    /// Full original payload.
    pub entry: QueueEntry,

    /// Total handler failures, including the one that exhausted the budget.
    pub failure_count: u32,

    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    pub last_error: String,
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Builder for a submission. The engine's public API for creating jobs.
pub struct NewJob {
    pub(crate) case_label: Option<String>,
    pub(crate) parent_id: Option<JobId>,
    pub(crate) artifacts: Vec<NewArtifact>,
}

impl NewJob {
    pub fn new() -> Self {
        Self {
            case_label: None,
            parent_id: None,
            artifacts: Vec::new(),
        }
    }

    pub fn case_label(mut self, label: impl Into<String>) -> Self {
        self.case_label = Some(label.into());
        self
    }

    pub fn parent(mut self, parent_id: JobId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn artifact(mut self, artifact: NewArtifact) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

impl Default for NewJob {
    fn default() -> Self {
        Self::new()
    }
}

/// One artifact within a submission.
pub struct NewArtifact {
    pub(crate) filename: String,
    pub(crate) artifact_type: ArtifactType,
    pub(crate) source_ref: String,
    pub(crate) options: serde_json::Value,
}

impl NewArtifact {
    pub fn new(filename: impl Into<String>, artifact_type: ArtifactType) -> Self {
        let filename = filename.into();
        Self {
            // Storage reference defaults to the filename until set.
            source_ref: filename.clone(),
            filename,
            artifact_type,
            options: serde_json::Value::Null,
        }
    }

    pub fn source_ref(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = source_ref.into();
        self
    }

    pub fn options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_transitions_follow_the_lifecycle() {
        use ArtifactStatus::*;

        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(AwaitingDownstream));
        assert!(Processing.can_transition_to(Failed));
        assert!(AwaitingDownstream.can_transition_to(Completed));
        assert!(Failed.can_transition_to(Queued));

        // A finished local chain must not skip the downstream wait.
        assert!(!AwaitingDownstream.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn awaiting_downstream_is_not_terminal() {
        assert!(!ArtifactStatus::AwaitingDownstream.is_terminal());
        assert!(!ArtifactStatus::Processing.is_terminal());
        assert!(ArtifactStatus::Completed.is_terminal());
        assert!(ArtifactStatus::Failed.is_terminal());
    }

    #[test]
    fn job_transitions_follow_the_lifecycle() {
        use JobStatus::*;

        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Processing)); // replay
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Queued));
    }

    #[test]
    fn statuses_round_trip_through_strings() {
        for status in [
            ArtifactStatus::Queued,
            ArtifactStatus::Processing,
            ArtifactStatus::AwaitingDownstream,
            ArtifactStatus::Completed,
            ArtifactStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ArtifactStatus>().unwrap(), status);
        }
        for status in [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        for ty in ArtifactType::ALL {
            assert_eq!(ty.as_str().parse::<ArtifactType>().unwrap(), ty);
        }
    }

    #[test]
    fn ids_display_short() {
        let id = JobId::new();
        assert_eq!(id.to_string().len(), 8);
    }
}
