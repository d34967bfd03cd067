//! # Stream Manager
//!
//! The producer/consumer facade over durable streams: enqueue, consumer-group
//! creation, claim (with a lazy reclaim sweep so expired deliveries surface
//! without waiting for the periodic pass), blocking claim with cooperative
//! polling, and acks.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::StreamSettings;
use crate::store::{EntryId, EntryRecord, GroupInfo, StateStore};

use super::delivery::DeliveryTracker;
use super::StreamError;

/// Unique consumer identity for this process, e.g. `"worker-1f2e3d..."`.
/// Consumers that crash and restart should claim under a fresh name so stale
/// ownership records never collide.
pub fn consumer_name(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

pub struct StreamManager {
    store: Arc<dyn StateStore>,
    settings: StreamSettings,
    tracker: Arc<DeliveryTracker>,
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("settings", &self.settings)
            .finish()
    }
}

impl StreamManager {
    pub fn new(store: Arc<dyn StateStore>, settings: StreamSettings) -> Self {
        let tracker = Arc::new(DeliveryTracker::new(store.clone(), &settings));
        Self {
            store,
            settings,
            tracker,
        }
    }

    /// The delivery tracker, for running its periodic reclaim loop.
    pub fn tracker(&self) -> Arc<DeliveryTracker> {
        self.tracker.clone()
    }

    /// Durably append an entry. The returned id is strictly greater than every
    /// id previously returned for this stream.
    pub async fn enqueue(&self, stream: &str, payload: Value) -> Result<EntryId, StreamError> {
        let id = self.store.stream_append(stream, payload).await?;
        debug!(stream = %stream, entry_id = %id, "📤 STREAM: entry enqueued");
        Ok(id)
    }

    /// Idempotently create a consumer group over one or more streams. With
    /// `replay` false the group sees only entries appended after creation.
    pub async fn create_group(
        &self,
        group: &str,
        streams: &[String],
        replay: bool,
    ) -> Result<(), StreamError> {
        self.store.group_create(group, streams, replay).await?;
        info!(group = %group, streams = ?streams, replay = replay, "👥 STREAM: consumer group ready");
        Ok(())
    }

    /// Claim up to `count` entries for `consumer`, non-blocking. Runs a lazy
    /// reclaim sweep first so entries whose visibility timeout just lapsed are
    /// immediately eligible again.
    pub async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<EntryRecord>, StreamError> {
        let now = Utc::now();
        self.tracker.sweep(stream, group, now).await?;
        let entries = self
            .store
            .stream_claim(
                stream,
                group,
                consumer,
                count,
                now,
                self.settings.visibility_timeout(),
            )
            .await?;
        if !entries.is_empty() {
            debug!(
                stream = %stream,
                group = %group,
                consumer = %consumer,
                claimed = entries.len(),
                "📥 STREAM: entries claimed"
            );
        }
        Ok(entries)
    }

    /// Claim with a bounded wait: polls cooperatively until entries arrive or
    /// `block_timeout` elapses, then returns whatever is available (possibly
    /// nothing).
    pub async fn claim_blocking(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_timeout: Duration,
    ) -> Result<Vec<EntryRecord>, StreamError> {
        let deadline = Instant::now() + block_timeout;
        loop {
            let entries = self.claim(stream, group, consumer, count).await?;
            if !entries.is_empty() || Instant::now() >= deadline {
                return Ok(entries);
            }
            let remaining = deadline - Instant::now();
            tokio::time::sleep(remaining.min(self.settings.claim_poll_interval())).await;
        }
    }

    /// Acknowledge a delivered entry, removing it from this group's pending
    /// set. Idempotent: repeated or foreign acks return false.
    pub async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool, StreamError> {
        let acked = self.store.stream_ack(stream, group, id).await?;
        if acked {
            debug!(stream = %stream, group = %group, entry_id = %id, "✅ STREAM: entry acked");
        }
        Ok(acked)
    }

    /// Claimable backlog for one (stream, group) pair.
    pub async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, StreamError> {
        Ok(self.store.pending_count(stream, group).await?)
    }

    /// All registered consumer groups with their streams and backlog.
    pub async fn groups(&self) -> Result<Vec<GroupInfo>, StreamError> {
        Ok(self.store.group_list().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::store::MemoryStateStore;

    fn manager(visibility_ms: u64) -> StreamManager {
        StreamManager::new(
            Arc::new(MemoryStateStore::new()),
            StreamSettings {
                visibility_timeout_seconds: (visibility_ms / 1_000).max(1),
                max_retries: 3,
                backoff_base_ms: 10,
                backoff_max_ms: 100,
                claim_poll_interval_ms: 10,
                ..StreamSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn test_enqueue_claim_ack_cycle() {
        let mgr = manager(30_000);
        mgr.create_group("workers", &["jobs".to_string()], true)
            .await
            .unwrap();

        let mut ids = Vec::new();
        for n in 0..5 {
            ids.push(mgr.enqueue("jobs", json!({"n": n})).await.unwrap());
        }
        // Ids are strictly increasing in append order.
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
        }

        let claimed = mgr.claim("jobs", "workers", "c1", 3).await.unwrap();
        assert_eq!(claimed.len(), 3);
        assert_eq!(claimed[0].payload, json!({"n": 0}));

        for entry in &claimed {
            assert!(mgr.ack("jobs", "workers", entry.id).await.unwrap());
        }
        // Re-ack is a no-op.
        assert!(!mgr.ack("jobs", "workers", claimed[0].id).await.unwrap());

        let rest = mgr.claim("jobs", "workers", "c2", 10).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].payload, json!({"n": 3}));
        assert_eq!(mgr.pending_count("jobs", "workers").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_new_group_skips_history_unless_replay() {
        let mgr = manager(30_000);
        mgr.enqueue("jobs", json!("old")).await.unwrap();

        mgr.create_group("tail", &["jobs".to_string()], false)
            .await
            .unwrap();
        mgr.create_group("replay", &["jobs".to_string()], true)
            .await
            .unwrap();
        mgr.enqueue("jobs", json!("new")).await.unwrap();

        let tail = mgr.claim("jobs", "tail", "c", 10).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].payload, json!("new"));

        let replay = mgr.claim("jobs", "replay", "c", 10).await.unwrap();
        assert_eq!(replay.len(), 2);
    }

    #[tokio::test]
    async fn test_claim_blocking_returns_when_work_arrives() {
        let mgr = Arc::new(manager(30_000));
        mgr.create_group("g", &["jobs".to_string()], true)
            .await
            .unwrap();

        let consumer = mgr.clone();
        let waiter = tokio::spawn(async move {
            consumer
                .claim_blocking("jobs", "g", "c", 1, Duration::from_secs(2))
                .await
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        mgr.enqueue("jobs", json!("late")).await.unwrap();

        let entries = waiter.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, json!("late"));
    }

    #[tokio::test]
    async fn test_claim_blocking_times_out_empty() {
        let mgr = manager(30_000);
        mgr.create_group("g", &["jobs".to_string()], true)
            .await
            .unwrap();

        let entries = mgr
            .claim_blocking("jobs", "g", "c", 1, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_claimed_entries_invisible_to_other_consumers() {
        let mgr = manager(30_000);
        mgr.create_group("g", &["jobs".to_string()], true)
            .await
            .unwrap();
        mgr.enqueue("jobs", json!(1)).await.unwrap();

        let c1 = consumer_name("worker");
        let c2 = consumer_name("worker");
        assert_ne!(c1, c2);

        let first = mgr.claim("jobs", "g", &c1, 10).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = mgr.claim("jobs", "g", &c2, 10).await.unwrap();
        assert!(second.is_empty());
    }
}
