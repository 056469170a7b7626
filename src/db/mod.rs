//! Database pool, schema, and health check.
//!
//! One SQLite database backs both the system-of-record (jobs, artifacts) and
//! the broker's queue table; every module shares this pool. UUIDs are stored
//! as TEXT, timestamps as RFC 3339 TEXT, JSON payloads as serialized TEXT.

pub mod artifacts;
pub mod jobs;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Database handle. Owns the connection pool shared across all modules.
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Open a database file, creating it and the schema if needed.
    pub async fn open(path: &str) -> Result<Self> {
        let url = format!("sqlite://{path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(&url)
            .await?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// In-memory database for tests. Single connection: every `:memory:`
    /// connection is its own database, so the pool must never open a second.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS jobs (
                id           TEXT PRIMARY KEY,
                case_label   TEXT,
                parent_id    TEXT REFERENCES jobs(id),
                status       TEXT NOT NULL DEFAULT 'queued',
                total_files  INTEGER NOT NULL,
                archived     INTEGER NOT NULL DEFAULT 0,
                created_at   TEXT NOT NULL,
                started_at   TEXT,
                completed_at TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_case ON jobs(case_label)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS artifacts (
                id            TEXT PRIMARY KEY,
                job_id        TEXT NOT NULL REFERENCES jobs(id),
                position      INTEGER NOT NULL DEFAULT 0,
                artifact_type TEXT NOT NULL,
                filename      TEXT NOT NULL,
                source_ref    TEXT NOT NULL,
                options       TEXT NOT NULL DEFAULT 'null',
                status        TEXT NOT NULL DEFAULT 'queued',
                current_stage TEXT,
                stage_timings TEXT NOT NULL DEFAULT '{}',
                retry_count   INTEGER NOT NULL DEFAULT 0,
                last_error    TEXT,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL,
                completed_at  TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_artifacts_job ON artifacts(job_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_artifacts_status ON artifacts(status)")
            .execute(&self.pool)
            .await?;

        // Broker state. The location column is what makes "exactly one of
        // work queue / retry schedule / dead-letter store" structural.
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS queue_entries (
                seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                queue           TEXT NOT NULL,
                location        TEXT NOT NULL DEFAULT 'work',
                job_id          TEXT NOT NULL,
                artifact_id     TEXT NOT NULL,
                retry_count     INTEGER NOT NULL DEFAULT 0,
                eligible_at     TEXT,
                first_failed_at TEXT,
                last_failed_at  TEXT,
                failure_count   INTEGER NOT NULL DEFAULT 0,
                last_error      TEXT,
                enqueued_at     TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queue_work ON queue_entries(queue, location, seq)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queue_retry
             ON queue_entries(queue, location, eligible_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Simple health check — run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Get a reference to the connection pool (for submodules and the broker).
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Column codecs
// ---------------------------------------------------------------------------

pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>()
        .map_err(|e| Error::Other(format!("bad timestamp {s:?}: {e}")))
}

pub(crate) fn parse_opt_ts(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    s.map(parse_ts).transpose()
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::Other(format!("bad uuid {s:?}: {e}")))
}
