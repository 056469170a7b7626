//! Metric instrument factories for intake-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"intake-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for intake-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("intake-rs")
}

/// Counter: number of artifacts accepted at the submission boundary.
/// Labels: `artifact_type`.
pub fn artifacts_submitted() -> Counter<u64> {
    meter()
        .u64_counter("intake.artifacts.submitted")
        .with_description("Number of artifacts submitted")
        .build()
}

/// Counter: job and artifact status transitions.
/// Labels: `entity` ("job" | "artifact"), `from`, `to`.
pub fn state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("intake.state_transitions")
        .with_description("Number of job/artifact status transitions")
        .build()
}

/// Counter: queue-level operations (push, pop, schedule, requeue, ...).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("intake.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Histogram: wall-clock duration of one stage-handler invocation.
/// Labels: `artifact_type`, `stage`, `result` ("ok" | "deferred" | "error").
pub fn stage_duration_seconds() -> Histogram<f64> {
    meter()
        .f64_histogram("intake.stage.duration_seconds")
        .with_description("Stage handler duration in seconds")
        .with_unit("s")
        .build()
}

/// Counter: retries parked in the backoff schedule.
/// Labels: `queue`.
pub fn retries_scheduled() -> Counter<u64> {
    meter()
        .u64_counter("intake.retries.scheduled")
        .with_description("Number of entries scheduled for retry")
        .build()
}

/// Counter: entries moved to the dead-letter store.
/// Labels: `queue`.
pub fn dead_letters() -> Counter<u64> {
    meter()
        .u64_counter("intake.dead_letters")
        .with_description("Number of entries dead-lettered")
        .build()
}

/// Counter: status cache lookups.
/// Labels: `namespace`, `result` ("hit" | "miss" | "expired").
pub fn cache_lookups() -> Counter<u64> {
    meter()
        .u64_counter("intake.cache.lookups")
        .with_description("Number of status cache lookups")
        .build()
}
