//! Work queue, retry schedule, and dead-letter behavior of the SQLite
//! broker.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use intake::broker::{Broker, SqliteBroker};
use intake::db::Db;
use intake::error::Error;
use intake::model::{ArtifactId, JobId, QueueEntry};

async fn test_broker() -> SqliteBroker {
    let db = Arc::new(Db::in_memory().await.expect("in-memory db"));
    SqliteBroker::new(db)
}

fn entry(queue: &str) -> QueueEntry {
    QueueEntry::new(JobId::new(), ArtifactId::new(), queue)
}

// ---------------------------------------------------------------------------
// Work queue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pop_is_fifo_within_a_queue() {
    let broker = test_broker().await;
    let first = entry("document");
    let second = entry("document");
    let third = entry("document");

    broker.push(first.clone()).await.unwrap();
    broker.push(second.clone()).await.unwrap();
    broker.push(third.clone()).await.unwrap();
    assert_eq!(broker.len("document").await.unwrap(), 3);

    let timeout = Duration::from_secs(1);
    let popped: Vec<ArtifactId> = [
        broker.pop("document", timeout).await.unwrap().unwrap(),
        broker.pop("document", timeout).await.unwrap().unwrap(),
        broker.pop("document", timeout).await.unwrap().unwrap(),
    ]
    .iter()
    .map(|e| e.artifact_id)
    .collect();

    assert_eq!(
        popped,
        vec![first.artifact_id, second.artifact_id, third.artifact_id]
    );
    assert_eq!(broker.len("document").await.unwrap(), 0);
}

#[tokio::test]
async fn pop_times_out_on_an_empty_queue() {
    let broker = test_broker().await;
    let popped = broker
        .pop("document", Duration::from_millis(50))
        .await
        .unwrap();
    assert!(popped.is_none());
}

#[tokio::test]
async fn pop_wakes_for_a_push_that_lands_mid_wait() {
    let broker = Arc::new(test_broker().await);
    let pushed = entry("audio");

    let background = Arc::clone(&broker);
    let to_push = pushed.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        background.push(to_push).await.unwrap();
    });

    let popped = broker
        .pop("audio", Duration::from_secs(5))
        .await
        .unwrap()
        .expect("pop should see the late push");
    assert_eq!(popped.artifact_id, pushed.artifact_id);
}

#[tokio::test]
async fn queues_are_isolated() {
    let broker = test_broker().await;
    broker.push(entry("audio")).await.unwrap();

    assert!(broker
        .pop("document", Duration::from_millis(50))
        .await
        .unwrap()
        .is_none());
    assert!(broker
        .pop("audio", Duration::from_millis(50))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn unknown_queue_names_are_refused() {
    let broker = test_broker().await;

    let err = broker.push(entry("nope")).await.unwrap_err();
    assert!(matches!(err, Error::UnknownQueue(_)), "got {err:?}");

    let err = broker
        .pop("nope", Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownQueue(_)), "got {err:?}");
}

// ---------------------------------------------------------------------------
// Retry schedule
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scheduled_entries_stay_parked_until_due() {
    let broker = test_broker().await;
    let parked = entry("document");

    broker
        .schedule_at(parked.clone(), Utc::now() + ChronoDuration::hours(1))
        .await
        .unwrap();
    assert_eq!(broker.retry_len("document").await.unwrap(), 1);
    assert_eq!(broker.len("document").await.unwrap(), 0);

    // Not due yet.
    assert!(broker.pop_due("document", Utc::now()).await.unwrap().is_empty());
    assert_eq!(broker.retry_len("document").await.unwrap(), 1);

    // Due: moved onto the work queue and returned.
    let moved = broker
        .pop_due("document", Utc::now() + ChronoDuration::hours(2))
        .await
        .unwrap();
    assert_eq!(moved.len(), 1);
    assert_eq!(moved[0].artifact_id, parked.artifact_id);
    assert_eq!(broker.retry_len("document").await.unwrap(), 0);
    assert_eq!(broker.len("document").await.unwrap(), 1);

    let popped = broker
        .pop("document", Duration::from_secs(1))
        .await
        .unwrap()
        .expect("moved entry should be claimable");
    assert_eq!(popped.artifact_id, parked.artifact_id);
}

#[tokio::test]
async fn due_entries_join_the_work_queue_tail_in_eligibility_order() {
    let broker = test_broker().await;
    let now = Utc::now();

    let waiting = entry("document");
    broker.push(waiting.clone()).await.unwrap();

    // Scheduled out of submission order; the more overdue entry moves first.
    let later = entry("document");
    let earlier = entry("document");
    broker
        .schedule_at(later.clone(), now - ChronoDuration::seconds(10))
        .await
        .unwrap();
    broker
        .schedule_at(earlier.clone(), now - ChronoDuration::seconds(20))
        .await
        .unwrap();

    let moved = broker.pop_due("document", now).await.unwrap();
    assert_eq!(moved.len(), 2);
    assert_eq!(moved[0].artifact_id, earlier.artifact_id);
    assert_eq!(moved[1].artifact_id, later.artifact_id);

    // Tail placement: the entry already waiting keeps its head spot.
    let timeout = Duration::from_secs(1);
    let order: Vec<ArtifactId> = [
        broker.pop("document", timeout).await.unwrap().unwrap(),
        broker.pop("document", timeout).await.unwrap().unwrap(),
        broker.pop("document", timeout).await.unwrap().unwrap(),
    ]
    .iter()
    .map(|e| e.artifact_id)
    .collect();
    assert_eq!(
        order,
        vec![waiting.artifact_id, earlier.artifact_id, later.artifact_id]
    );
}

#[tokio::test]
async fn retry_payload_survives_the_park() {
    let broker = test_broker().await;
    let mut failed = entry("video");
    failed.retry_count = 2;
    failed.first_failed_at = Some(Utc::now() - ChronoDuration::minutes(1));
    failed.last_error = Some("decoder crashed".to_string());

    broker
        .schedule_at(failed.clone(), Utc::now() - ChronoDuration::seconds(1))
        .await
        .unwrap();
    let moved = broker.pop_due("video", Utc::now()).await.unwrap();

    assert_eq!(moved.len(), 1);
    assert_eq!(moved[0].retry_count, 2);
    assert_eq!(moved[0].last_error.as_deref(), Some("decoder crashed"));
    assert!(moved[0].first_failed_at.is_some());
}

#[tokio::test]
async fn pending_sees_work_and_retry_entries() {
    let broker = test_broker().await;
    let queued = entry("document");
    let parked = entry("document");

    broker.push(queued.clone()).await.unwrap();
    broker
        .schedule_at(parked.clone(), Utc::now() + ChronoDuration::hours(1))
        .await
        .unwrap();

    assert!(broker.pending("document", queued.artifact_id).await.unwrap());
    assert!(broker.pending("document", parked.artifact_id).await.unwrap());
    assert!(!broker.pending("document", ArtifactId::new()).await.unwrap());

    // A claimed entry is no longer pending.
    broker.pop("document", Duration::from_secs(1)).await.unwrap();
    assert!(!broker.pending("document", queued.artifact_id).await.unwrap());
}

// ---------------------------------------------------------------------------
// Dead letters
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dead_letters_preserve_failure_diagnostics() {
    let broker = test_broker().await;
    let first_failed_at = Utc::now() - ChronoDuration::minutes(10);
    let last_failed_at = Utc::now();

    let mut exhausted = entry("document");
    exhausted.retry_count = 4;
    exhausted.first_failed_at = Some(first_failed_at);
    exhausted.last_error = Some("ocr engine oom".to_string());

    broker
        .dead_letter(exhausted.clone(), last_failed_at)
        .await
        .unwrap();
    assert_eq!(broker.len("document").await.unwrap(), 0);

    let dead = broker.list_dead("document").await.unwrap();
    assert_eq!(dead.len(), 1);
    let letter = &dead[0];
    assert!(letter.seq > 0);
    assert_eq!(letter.failure_count, 4);
    assert_eq!(letter.last_error, "ocr engine oom");
    assert_eq!(letter.entry.artifact_id, exhausted.artifact_id);
    assert!(letter.first_failed_at <= letter.last_failed_at);
}

#[tokio::test]
async fn replay_requeues_with_a_fresh_retry_budget() {
    let broker = test_broker().await;
    let mut exhausted = entry("document");
    exhausted.retry_count = 4;
    exhausted.first_failed_at = Some(Utc::now());
    exhausted.last_error = Some("boom".to_string());

    broker.dead_letter(exhausted.clone(), Utc::now()).await.unwrap();
    let seq = broker.list_dead("document").await.unwrap()[0].seq;

    let replayed = broker.replay_dead("document", seq).await.unwrap();
    assert_eq!(replayed.artifact_id, exhausted.artifact_id);
    assert_eq!(replayed.retry_count, 0);
    assert!(replayed.first_failed_at.is_none());
    assert!(replayed.last_error.is_none());

    assert!(broker.list_dead("document").await.unwrap().is_empty());
    let popped = broker
        .pop("document", Duration::from_secs(1))
        .await
        .unwrap()
        .expect("replayed entry should be claimable");
    assert_eq!(popped.retry_count, 0);
}

#[tokio::test]
async fn purge_drops_the_dead_letter_outright() {
    let broker = test_broker().await;
    broker.dead_letter(entry("document"), Utc::now()).await.unwrap();
    let seq = broker.list_dead("document").await.unwrap()[0].seq;

    broker.purge_dead("document", seq).await.unwrap();
    assert!(broker.list_dead("document").await.unwrap().is_empty());
    assert_eq!(broker.len("document").await.unwrap(), 0);

    let err = broker.purge_dead("document", seq).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "got {err:?}");
}
