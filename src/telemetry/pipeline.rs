//! Pipeline execution span helpers.
//!
//! Provides span creation and stage-event recording for artifacts flowing
//! through a worker's stage chain.

use tracing::Span;
use uuid::Uuid;

/// Start a span covering one dispatch of an artifact through its chain.
///
/// The `pipeline.stage` field is declared empty and is updated via
/// [`record_stage`] as the chain advances.
pub fn start_artifact_span(artifact_type: &str, artifact_id: &Uuid) -> Span {
    tracing::info_span!(
        "pipeline.execute",
        "pipeline.artifact_type" = artifact_type,
        "pipeline.artifact_id" = %artifact_id,
        "pipeline.stage" = tracing::field::Empty,
    )
}

/// Record entry into a stage on the dispatch span.
pub fn record_stage(span: &Span, stage: &str) {
    span.record("pipeline.stage", stage);
    span.in_scope(|| {
        tracing::info!(stage, "stage_started");
    });
}

/// Record a stage outcome event on the dispatch span.
pub fn record_stage_outcome(span: &Span, stage: &str, outcome: &str) {
    span.in_scope(|| {
        tracing::info!(stage, outcome, "stage_finished");
    });
}
