//! # Dead-Letter Queue
//!
//! Inspection and re-injection of quarantined entries. Dead-lettered entries
//! keep their payload, full retry count, and quarantine reason so an operator
//! can diagnose before requeuing.

use std::sync::Arc;

use tracing::info;

use crate::store::{EntryId, EntryRecord, StateStore};

use super::StreamError;

#[derive(Debug)]
pub struct DeadLetterQueue {
    store: Arc<dyn StateStore>,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Quarantined entries for a stream, oldest first, with retry history and
    /// quarantine reason intact.
    pub async fn entries(&self, stream: &str) -> Result<Vec<EntryRecord>, StreamError> {
        Ok(self.store.dead_letter_entries(stream).await?)
    }

    pub async fn len(&self, stream: &str) -> Result<usize, StreamError> {
        Ok(self.entries(stream).await?.len())
    }

    pub async fn is_empty(&self, stream: &str) -> Result<bool, StreamError> {
        Ok(self.len(stream).await? == 0)
    }

    /// Re-inject a quarantined entry as a fresh PENDING entry with a reset
    /// retry count. Returns the new id, or None when the entry is not in the
    /// dead-letter set (already requeued, or never quarantined).
    pub async fn requeue(
        &self,
        stream: &str,
        id: EntryId,
    ) -> Result<Option<EntryId>, StreamError> {
        let requeued = self.store.requeue_dead_letter(stream, id).await?;
        if let Some(new_id) = requeued {
            info!(
                stream = %stream,
                dead_id = %id,
                new_id = %new_id,
                "♻️ DLQ: entry requeued for redelivery"
            );
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use crate::store::{EntryStatus, MemoryStateStore, StateStore};

    async fn quarantine_one(store: &Arc<MemoryStateStore>) -> EntryId {
        store
            .group_create("g", &["jobs".to_string()], true)
            .await
            .unwrap();
        let id = store.stream_append("jobs", json!({"job": "x"})).await.unwrap();
        store
            .stream_claim("jobs", "g", "c", 1, Utc::now(), Duration::from_millis(1))
            .await
            .unwrap();
        let later = Utc::now() + chrono::Duration::seconds(1);
        assert!(store
            .stream_dead_letter("jobs", id, later, "max_retries_exceeded")
            .await
            .unwrap());
        id
    }

    #[tokio::test]
    async fn test_entries_expose_reason_and_history() {
        let store = Arc::new(MemoryStateStore::new());
        quarantine_one(&store).await;

        let dlq = DeadLetterQueue::new(store);
        assert_eq!(dlq.len("jobs").await.unwrap(), 1);
        let entries = dlq.entries("jobs").await.unwrap();
        assert_eq!(entries[0].status, EntryStatus::Dead);
        assert_eq!(entries[0].dead_reason.as_deref(), Some("max_retries_exceeded"));
        assert_eq!(entries[0].payload, json!({"job": "x"}));
    }

    #[tokio::test]
    async fn test_requeue_produces_fresh_pending_entry() {
        let store = Arc::new(MemoryStateStore::new());
        let dead_id = quarantine_one(&store).await;

        let dlq = DeadLetterQueue::new(store.clone());
        let new_id = dlq.requeue("jobs", dead_id).await.unwrap().unwrap();
        assert!(new_id > dead_id);
        assert!(dlq.is_empty("jobs").await.unwrap());

        // The fresh entry is claimable again with a clean retry count.
        let claimed = store
            .stream_claim("jobs", "g", "c", 1, Utc::now(), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, new_id);
        assert_eq!(claimed[0].retry_count, 0);

        // Double requeue is a no-op.
        assert!(dlq.requeue("jobs", dead_id).await.unwrap().is_none());
    }
}
