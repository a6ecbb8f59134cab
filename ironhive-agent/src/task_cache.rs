//! Task-id idempotency cache
//!
//! Every side-effecting RPC carries a task id; a retried request with a
//! task id we already completed gets the cached result back instead of
//! repeating the side effect. Entries outlive the controller's
//! reconciliation interval; the cache is memory-only, so after an agent
//! restart reconciliation re-queries entity state and converges.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::RwLock;
use tracing::debug;

/// How long a completed result is retained
const RETENTION_SECS: i64 = 300;

struct CacheEntry {
    result: serde_json::Value,
    stored_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct TaskCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    // std lock so long-running work can poll from sync contexts; held
    // only for set operations
    cancelled: Arc<StdRwLock<HashSet<String>>>,
}

impl TaskCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached successful result for a task id, if still retained
    pub async fn get(&self, task_id: &str) -> Option<serde_json::Value> {
        let entries = self.entries.read().await;
        entries.get(task_id).and_then(|entry| {
            if Utc::now() - entry.stored_at < ChronoDuration::seconds(RETENTION_SECS) {
                Some(entry.result.clone())
            } else {
                None
            }
        })
    }

    /// Record a successful result; prunes aged entries on the way
    pub async fn put(&self, task_id: &str, result: serde_json::Value) {
        let cutoff = Utc::now() - ChronoDuration::seconds(RETENTION_SECS);
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.stored_at > cutoff);
        entries.insert(
            task_id.to_string(),
            CacheEntry {
                result,
                stored_at: Utc::now(),
            },
        );
    }

    /// Mark a task cancelled (advisory, from `rpc.cancel`)
    pub fn cancel(&self, task_id: &str) {
        debug!(task_id, "task marked cancelled");
        if let Ok(mut cancelled) = self.cancelled.write() {
            cancelled.insert(task_id.to_string());
        }
    }

    /// Long-running work polls this to abandon a cancelled job
    pub fn is_cancelled(&self, task_id: &str) -> bool {
        self.cancelled
            .read()
            .map(|c| c.contains(task_id))
            .unwrap_or(false)
    }

    /// Forget a cancellation mark once the task is finished either way
    pub fn clear_cancelled(&self, task_id: &str) {
        if let Ok(mut cancelled) = self.cancelled.write() {
            cancelled.remove(task_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_hit_returns_cached_result() {
        let cache = TaskCache::new();
        assert!(cache.get("t1").await.is_none());

        cache.put("t1", json!({"uuid": "abc"})).await;
        let hit = cache.get("t1").await.unwrap();
        assert_eq!(hit["uuid"], "abc");

        // A second read still hits; the entry is not consumed.
        assert!(cache.get("t1").await.is_some());
    }

    #[test]
    fn test_cancellation_flag() {
        let cache = TaskCache::new();
        assert!(!cache.is_cancelled("t1"));
        cache.cancel("t1");
        assert!(cache.is_cancelled("t1"));
        cache.clear_cancelled("t1");
        assert!(!cache.is_cancelled("t1"));
    }
}
