//! Read-through TTL cache for status snapshots.
//!
//! Advisory only: the database stays authoritative and a miss or expiry
//! just costs a re-read. Writers invalidate before touching the database,
//! so a reader racing the write re-loads fresh state instead of pinning
//! the stale snapshot for a full TTL.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::model::{ArtifactId, JobId};
use crate::telemetry::metrics;

pub fn job_status_key(id: JobId) -> String {
    format!("job-status:{}", id.0)
}

pub fn artifact_status_key(id: ArtifactId) -> String {
    format!("artifact-status:{}", id.0)
}

/// TTL per key namespace. Live status is polled, so it expires within
/// seconds; profile data barely changes; derived snapshots sit in between.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// `job-status:` and `artifact-status:` keys.
    pub status_ttl: Duration,
    /// `profile:` keys.
    pub profile_ttl: Duration,
    /// Any other namespace.
    pub derived_ttl: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            status_ttl: Duration::from_secs(5),
            profile_ttl: Duration::from_secs(300),
            derived_ttl: Duration::from_secs(60),
        }
    }
}

impl CachePolicy {
    fn ttl_for(&self, key: &str) -> Duration {
        if key.starts_with("job-status:") || key.starts_with("artifact-status:") {
            self.status_ttl
        } else if key.starts_with("profile:") {
            self.profile_ttl
        } else {
            self.derived_ttl
        }
    }
}

struct Slot {
    value: Value,
    expires_at: Instant,
}

/// In-process snapshot cache. Multi-writer last-write-wins; correctness
/// only needs staleness bounded by the TTL.
pub struct StatusCache {
    policy: CachePolicy,
    slots: RwLock<HashMap<String, Slot>>,
}

impl StatusCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            policy,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Cached value if present and unexpired. Expired slots stay in place
    /// until the next `set` or `purge_expired`; removal needs a write lock
    /// and the read path should not take one.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let slots = self.slots.read().await;
        let result = match slots.get(key) {
            Some(slot) if slot.expires_at > Instant::now() => Some(slot.value.clone()),
            Some(_) => {
                record_lookup(key, "expired");
                return None;
            }
            None => None,
        };
        record_lookup(key, if result.is_some() { "hit" } else { "miss" });
        result
    }

    /// Store a value under the namespace TTL for its key.
    pub async fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let expires_at = Instant::now() + self.policy.ttl_for(&key);
        self.slots
            .write()
            .await
            .insert(key, Slot { value, expires_at });
    }

    /// Delete a key outright.
    pub async fn invalidate(&self, key: &str) {
        self.slots.write().await.remove(key);
    }

    /// Drop the job snapshot and, when given, one artifact snapshot in a
    /// single locked pass. Called before every status-bearing write.
    pub async fn invalidate_status(&self, job_id: JobId, artifact_id: Option<ArtifactId>) {
        let mut slots = self.slots.write().await;
        slots.remove(&job_status_key(job_id));
        if let Some(artifact_id) = artifact_id {
            slots.remove(&artifact_status_key(artifact_id));
        }
    }

    /// Remove every expired slot. Swept on the engine's housekeeping
    /// interval so the map stays bounded by live entities.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.write().await;
        let before = slots.len();
        slots.retain(|_, slot| slot.expires_at > now);
        before - slots.len()
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }
}

fn record_lookup(key: &str, result: &'static str) {
    let namespace = key.split(':').next().unwrap_or("unknown").to_string();
    metrics::cache_lookups().add(
        1,
        &[
            KeyValue::new("namespace", namespace),
            KeyValue::new("result", result),
        ],
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tiny_ttl() -> CachePolicy {
        CachePolicy {
            status_ttl: Duration::from_millis(20),
            profile_ttl: Duration::from_millis(20),
            derived_ttl: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn get_returns_what_set_stored() {
        let cache = StatusCache::new(CachePolicy::default());
        cache.set("job-status:abc", json!({"status": "processing"})).await;

        assert_eq!(
            cache.get("job-status:abc").await,
            Some(json!({"status": "processing"}))
        );
        assert_eq!(cache.get("job-status:other").await, None);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = StatusCache::new(tiny_ttl());
        cache.set("job-status:abc", json!(1)).await;
        assert!(cache.get("job-status:abc").await.is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("job-status:abc").await, None);
    }

    #[tokio::test]
    async fn invalidate_removes_immediately() {
        let cache = StatusCache::new(CachePolicy::default());
        cache.set("artifact-status:a", json!(1)).await;
        cache.invalidate("artifact-status:a").await;
        assert_eq!(cache.get("artifact-status:a").await, None);
    }

    #[tokio::test]
    async fn invalidate_status_clears_job_and_artifact_keys() {
        let cache = StatusCache::new(CachePolicy::default());
        let job = JobId::new();
        let artifact = ArtifactId::new();
        cache.set(job_status_key(job), json!(1)).await;
        cache.set(artifact_status_key(artifact), json!(2)).await;
        cache.set("profile:unrelated", json!(3)).await;

        cache.invalidate_status(job, Some(artifact)).await;

        assert_eq!(cache.get(&job_status_key(job)).await, None);
        assert_eq!(cache.get(&artifact_status_key(artifact)).await, None);
        assert!(cache.get("profile:unrelated").await.is_some());
    }

    #[tokio::test]
    async fn purge_drops_only_expired_slots() {
        let cache = StatusCache::new(CachePolicy {
            status_ttl: Duration::from_millis(10),
            profile_ttl: Duration::from_secs(60),
            derived_ttl: Duration::from_secs(60),
        });
        cache.set("job-status:soon", json!(1)).await;
        cache.set("profile:later", json!(2)).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        let purged = cache.purge_expired().await;

        assert_eq!(purged, 1);
        assert_eq!(cache.len().await, 1);
        assert!(cache.get("profile:later").await.is_some());
    }
}
