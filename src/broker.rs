//! Queue broker: per-type work queues, retry schedules, dead-letter stores.
//!
//! One `queue_entries` table holds every live entry; the `location` column
//! says which of the three places the entry occupies, so "exactly one of
//! work queue / retry schedule / dead-letter store" is structural. Claims
//! are single `DELETE ... RETURNING` statements: no two workers can pop the
//! same entry. Schedule and dead-letter moves run in one transaction so an
//! entry is never observable in two locations.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::Notify;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::model::{ArtifactId, ArtifactType, DeadLetter, JobId, QueueEntry};
use crate::telemetry::metrics;

/// Atomic queue state shared across workers. Implementations must make
/// push/pop and the schedule/dead-letter moves atomic; everything the
/// engine knows about ordering and exclusivity rests on that.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append an entry to the tail of its work queue and wake one waiter.
    async fn push(&self, entry: QueueEntry) -> Result<()>;

    /// Claim the head entry of a work queue, FIFO. Blocks up to `timeout`
    /// when the queue is empty, then returns None.
    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<QueueEntry>>;

    /// Entries currently waiting in the work queue.
    async fn len(&self, queue: &str) -> Result<u64>;

    /// Park an entry in the retry schedule until `eligible_at`.
    async fn schedule_at(&self, entry: QueueEntry, eligible_at: DateTime<Utc>) -> Result<()>;

    /// Move every parked entry whose eligible time has passed back onto the
    /// tail of its work queue, ordered by (eligible_at, insertion). Returns
    /// the moved entries.
    async fn pop_due(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<QueueEntry>>;

    /// Entries currently parked in the retry schedule.
    async fn retry_len(&self, queue: &str) -> Result<u64>;

    /// Whether any live entry (work or retry) references the artifact.
    /// Reconciliation checks this before re-enqueueing, so a slow backlog
    /// is not mistaken for a lost enqueue.
    async fn pending(&self, queue: &str, artifact_id: ArtifactId) -> Result<bool>;

    /// Move an entry into the dead-letter store with its final diagnostics.
    async fn dead_letter(&self, entry: QueueEntry, last_failed_at: DateTime<Utc>) -> Result<()>;

    /// Dead letters for a queue, oldest first.
    async fn list_dead(&self, queue: &str) -> Result<Vec<DeadLetter>>;

    /// Operator replay: remove a dead letter and re-enqueue its payload with
    /// the retry count reset to zero. Returns the re-enqueued entry.
    async fn replay_dead(&self, queue: &str, seq: i64) -> Result<QueueEntry>;

    /// Operator purge: drop a dead letter outright.
    async fn purge_dead(&self, queue: &str, seq: i64) -> Result<()>;
}

// ---------------------------------------------------------------------------
// SQLite broker
// ---------------------------------------------------------------------------

/// Broker over the shared database pool. Wakeups ride a per-queue
/// [`Notify`]; pollers fall back to their own timeout, so a missed permit
/// costs latency, never work.
pub struct SqliteBroker {
    db: Arc<Db>,
    queues: HashMap<String, Arc<Notify>>,
}

impl SqliteBroker {
    /// Broker serving one work queue per artifact type.
    pub fn new(db: Arc<Db>) -> Self {
        let queues = ArtifactType::ALL
            .iter()
            .map(|ty| (ty.queue_name().to_string(), Arc::new(Notify::new())))
            .collect();
        Self { db, queues }
    }

    fn notifier(&self, queue: &str) -> Result<Arc<Notify>> {
        self.queues
            .get(queue)
            .cloned()
            .ok_or_else(|| Error::UnknownQueue(queue.to_string()))
    }

    /// Single-statement claim of the queue head.
    async fn claim_next(&self, queue: &str) -> Result<Option<QueueEntry>> {
        let row: Option<EntryRow> = sqlx::query_as(
            "DELETE FROM queue_entries
             WHERE seq = (SELECT seq FROM queue_entries
                          WHERE queue = ?1 AND location = 'work'
                          ORDER BY seq LIMIT 1)
             RETURNING seq, queue, location, job_id, artifact_id, retry_count,
                       eligible_at, first_failed_at, last_failed_at,
                       failure_count, last_error, enqueued_at",
        )
        .bind(queue)
        .fetch_optional(self.db.pool())
        .await?;

        row.map(|r| r.try_into_entry()).transpose()
    }

    async fn insert_work_row<'e, E>(executor: E, entry: &QueueEntry, now: DateTime<Utc>) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        sqlx::query(
            "INSERT INTO queue_entries (queue, location, job_id, artifact_id, retry_count,
                                        first_failed_at, last_error, enqueued_at)
             VALUES (?, 'work', ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.queue)
        .bind(entry.job_id.0.to_string())
        .bind(entry.artifact_id.0.to_string())
        .bind(entry.retry_count as i64)
        .bind(entry.first_failed_at.map(crate::db::ts))
        .bind(&entry.last_error)
        .bind(crate::db::ts(now))
        .execute(executor)
        .await?;
        Ok(())
    }

    async fn count_location(&self, queue: &str, location: &str) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM queue_entries WHERE queue = ? AND location = ?")
                .bind(queue)
                .bind(location)
                .fetch_one(self.db.pool())
                .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl Broker for SqliteBroker {
    async fn push(&self, entry: QueueEntry) -> Result<()> {
        let notify = self.notifier(&entry.queue)?;

        Self::insert_work_row(self.db.pool(), &entry, Utc::now()).await?;

        record_queue_op(&entry.queue, "push");
        notify.notify_one();
        Ok(())
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<QueueEntry>> {
        let notify = self.notifier(queue)?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register for wakeups before checking, so a push that lands
            // between the check and the wait still wakes us.
            let mut notified = pin!(notify.notified());
            notified.as_mut().enable();

            if let Some(entry) = self.claim_next(queue).await? {
                record_queue_op(queue, "pop");
                return Ok(Some(entry));
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    record_queue_op(queue, "pop_empty");
                    return Ok(None);
                }
            }
        }
    }

    async fn len(&self, queue: &str) -> Result<u64> {
        self.notifier(queue)?;
        self.count_location(queue, "work").await
    }

    async fn schedule_at(&self, entry: QueueEntry, eligible_at: DateTime<Utc>) -> Result<()> {
        self.notifier(&entry.queue)?;

        sqlx::query(
            "INSERT INTO queue_entries (queue, location, job_id, artifact_id, retry_count,
                                        eligible_at, first_failed_at, last_error, enqueued_at)
             VALUES (?, 'retry', ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.queue)
        .bind(entry.job_id.0.to_string())
        .bind(entry.artifact_id.0.to_string())
        .bind(entry.retry_count as i64)
        .bind(crate::db::ts(eligible_at))
        .bind(entry.first_failed_at.map(crate::db::ts))
        .bind(&entry.last_error)
        .bind(crate::db::ts(Utc::now()))
        .execute(self.db.pool())
        .await?;

        record_queue_op(&entry.queue, "schedule");
        Ok(())
    }

    async fn pop_due(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<QueueEntry>> {
        let notify = self.notifier(queue)?;

        let mut tx = self.db.pool().begin().await?;
        let rows: Vec<EntryRow> = sqlx::query_as(
            "SELECT seq, queue, location, job_id, artifact_id, retry_count,
                    eligible_at, first_failed_at, last_failed_at,
                    failure_count, last_error, enqueued_at
             FROM queue_entries
             WHERE queue = ?1 AND location = 'retry' AND eligible_at <= ?2
             ORDER BY eligible_at, seq",
        )
        .bind(queue)
        .bind(crate::db::ts(now))
        .fetch_all(&mut *tx)
        .await?;

        let mut moved = Vec::with_capacity(rows.len());
        for row in rows {
            sqlx::query("DELETE FROM queue_entries WHERE seq = ?")
                .bind(row.seq)
                .execute(&mut *tx)
                .await?;
            let entry = row.try_into_entry()?;
            // Fresh row at the tail: re-enqueued work queues behind whatever
            // is already waiting.
            Self::insert_work_row(&mut *tx, &entry, now).await?;
            moved.push(entry);
        }
        tx.commit().await?;

        for _ in &moved {
            record_queue_op(queue, "requeue");
            notify.notify_one();
        }
        Ok(moved)
    }

    async fn retry_len(&self, queue: &str) -> Result<u64> {
        self.notifier(queue)?;
        self.count_location(queue, "retry").await
    }

    async fn pending(&self, queue: &str, artifact_id: ArtifactId) -> Result<bool> {
        self.notifier(queue)?;
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM queue_entries
             WHERE queue = ? AND artifact_id = ? AND location IN ('work', 'retry')",
        )
        .bind(queue)
        .bind(artifact_id.0.to_string())
        .fetch_one(self.db.pool())
        .await?;
        Ok(count > 0)
    }

    async fn dead_letter(&self, entry: QueueEntry, last_failed_at: DateTime<Utc>) -> Result<()> {
        self.notifier(&entry.queue)?;

        sqlx::query(
            "INSERT INTO queue_entries (queue, location, job_id, artifact_id, retry_count,
                                        first_failed_at, last_failed_at, failure_count,
                                        last_error, enqueued_at)
             VALUES (?, 'dead', ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.queue)
        .bind(entry.job_id.0.to_string())
        .bind(entry.artifact_id.0.to_string())
        .bind(entry.retry_count as i64)
        .bind(crate::db::ts(entry.first_failed_at.unwrap_or(last_failed_at)))
        .bind(crate::db::ts(last_failed_at))
        .bind(entry.retry_count as i64)
        .bind(&entry.last_error)
        .bind(crate::db::ts(Utc::now()))
        .execute(self.db.pool())
        .await?;

        record_queue_op(&entry.queue, "dead_letter");
        metrics::dead_letters().add(1, &[KeyValue::new("queue", entry.queue.clone())]);
        Ok(())
    }

    async fn list_dead(&self, queue: &str) -> Result<Vec<DeadLetter>> {
        self.notifier(queue)?;

        let rows: Vec<EntryRow> = sqlx::query_as(
            "SELECT seq, queue, location, job_id, artifact_id, retry_count,
                    eligible_at, first_failed_at, last_failed_at,
                    failure_count, last_error, enqueued_at
             FROM queue_entries
             WHERE queue = ? AND location = 'dead'
             ORDER BY seq",
        )
        .bind(queue)
        .fetch_all(self.db.pool())
        .await?;

        rows.into_iter().map(|r| r.try_into_dead_letter()).collect()
    }

    async fn replay_dead(&self, queue: &str, seq: i64) -> Result<QueueEntry> {
        let notify = self.notifier(queue)?;

        let mut tx = self.db.pool().begin().await?;
        let row: Option<EntryRow> = sqlx::query_as(
            "DELETE FROM queue_entries
             WHERE seq = ? AND queue = ? AND location = 'dead'
             RETURNING seq, queue, location, job_id, artifact_id, retry_count,
                       eligible_at, first_failed_at, last_failed_at,
                       failure_count, last_error, enqueued_at",
        )
        .bind(seq)
        .bind(queue)
        .fetch_optional(&mut *tx)
        .await?;
        let row = row.ok_or_else(|| Error::NotFound(format!("dead letter {seq} in {queue}")))?;

        let mut entry = row.try_into_entry()?;
        entry.retry_count = 0;
        entry.first_failed_at = None;
        entry.last_error = None;
        Self::insert_work_row(&mut *tx, &entry, Utc::now()).await?;
        tx.commit().await?;

        record_queue_op(queue, "replay");
        notify.notify_one();
        Ok(entry)
    }

    async fn purge_dead(&self, queue: &str, seq: i64) -> Result<()> {
        self.notifier(queue)?;

        let rows_affected =
            sqlx::query("DELETE FROM queue_entries WHERE seq = ? AND queue = ? AND location = 'dead'")
                .bind(seq)
                .bind(queue)
                .execute(self.db.pool())
                .await?
                .rows_affected();

        if rows_affected == 0 {
            return Err(Error::NotFound(format!("dead letter {seq} in {queue}")));
        }
        record_queue_op(queue, "purge");
        Ok(())
    }
}

fn record_queue_op(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct EntryRow {
    seq: i64,
    queue: String,
    #[allow(dead_code)]
    location: String,
    job_id: String,
    artifact_id: String,
    retry_count: i64,
    #[allow(dead_code)]
    eligible_at: Option<String>,
    first_failed_at: Option<String>,
    last_failed_at: Option<String>,
    failure_count: i64,
    last_error: Option<String>,
    enqueued_at: String,
}

impl EntryRow {
    fn try_into_entry(&self) -> Result<QueueEntry> {
        Ok(QueueEntry {
            job_id: JobId(crate::db::parse_uuid(&self.job_id)?),
            artifact_id: ArtifactId(crate::db::parse_uuid(&self.artifact_id)?),
            queue: self.queue.clone(),
            retry_count: self.retry_count as u32,
            first_failed_at: crate::db::parse_opt_ts(self.first_failed_at.as_deref())?,
            last_error: self.last_error.clone(),
        })
    }

    fn try_into_dead_letter(self) -> Result<DeadLetter> {
        let entry = self.try_into_entry()?;
        let enqueued_at = crate::db::parse_ts(&self.enqueued_at)?;
        let last_failed_at = crate::db::parse_opt_ts(self.last_failed_at.as_deref())?
            .unwrap_or(enqueued_at);
        Ok(DeadLetter {
            seq: self.seq,
            queue: self.queue,
            failure_count: self.failure_count as u32,
            first_failed_at: crate::db::parse_opt_ts(self.first_failed_at.as_deref())?
                .unwrap_or(last_failed_at),
            last_failed_at,
            last_error: self
                .last_error
                .unwrap_or_else(|| "unknown error".to_string()),
            entry,
        })
    }
}
