//! # intake-rs
//!
//! SQLite-backed orchestration engine for evidence-intake pipelines.
//!
//! Jobs group typed artifacts; each artifact rides a per-type work queue
//! through a declared stage chain, with exponential-backoff retries, a
//! dead-letter store, authoritative completion recounts, and OpenTelemetry
//! observability.

pub mod broker;
pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod handler;
pub mod model;
pub mod publisher;
pub mod registry;
pub mod status;
pub mod telemetry;
