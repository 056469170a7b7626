//! Error types for intake-rs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("unknown artifact type: {0}")]
    UnknownArtifactType(String),

    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("stage {stage:?} is not in the {artifact_type} sequence")]
    UnknownStage {
        stage: String,
        artifact_type: String,
    },

    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
