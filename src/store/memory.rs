//! # In-Memory State Store
//!
//! Single-process [`StateStore`] backend. All operations run under one lock, so
//! every trait method is trivially atomic. Used by the test suites and as the
//! circuit breaker's process-local degraded mode when the shared store is down.
//!
//! `set_unavailable` lets tests simulate backend outages.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{
    EntryId, EntryRecord, EntryStatus, GroupInfo, StateStore, StoreError, StoreResult,
    VersionedValue,
};

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<EntryId, EntryRecord>,
    dead: Vec<EntryRecord>,
    last_id: Option<EntryId>,
}

#[derive(Debug, Default, Clone)]
struct GroupState {
    streams: Vec<String>,
    /// Highest id handed out per stream; PENDING entries at or below the cursor
    /// were either delivered already or predate the group (no replay).
    cursors: HashMap<String, Option<EntryId>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    kv: HashMap<String, VersionedValue>,
    counters: HashMap<String, i64>,
    streams: HashMap<String, StreamState>,
    groups: HashMap<String, GroupState>,
}

/// Process-local store backend behind a single mutex
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryInner>,
    unavailable: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate backend outage: while set, every operation returns
    /// [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self, operation: &str) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable(operation, "memory store marked unavailable"));
        }
        Ok(())
    }

    fn next_id(state: &mut StreamState, now: DateTime<Utc>) -> EntryId {
        let millis = now.timestamp_millis();
        let id = match state.last_id {
            Some(last) if last.millis >= millis => EntryId::new(last.millis, last.seq + 1),
            _ => EntryId::new(millis, 0),
        };
        state.last_id = Some(id);
        id
    }

    fn claimable(
        entry: &EntryRecord,
        group: &str,
        cursor: Option<EntryId>,
        now: DateTime<Utc>,
    ) -> bool {
        match entry.status {
            EntryStatus::Pending => cursor.map_or(true, |c| entry.id > c),
            EntryStatus::RetryScheduled => {
                entry.owning_group.as_deref() == Some(group)
                    && entry.not_before.map_or(true, |t| t <= now)
            }
            _ => false,
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> StoreResult<Option<VersionedValue>> {
        self.check_available("get")?;
        Ok(self.inner.lock().kv.get(key).cloned())
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> StoreResult<u64> {
        self.check_available("put")?;
        let mut inner = self.inner.lock();
        let version = inner.kv.get(key).map_or(0, |v| v.version) + 1;
        inner
            .kv
            .insert(key.to_string(), VersionedValue { value, version });
        Ok(version)
    }

    async fn put_if_version(
        &self,
        key: &str,
        value: serde_json::Value,
        expected_version: u64,
    ) -> StoreResult<bool> {
        self.check_available("put_if_version")?;
        let mut inner = self.inner.lock();
        let current = inner.kv.get(key).map_or(0, |v| v.version);
        if current != expected_version {
            return Ok(false);
        }
        inner.kv.insert(
            key.to_string(),
            VersionedValue {
                value,
                version: current + 1,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check_available("delete")?;
        self.inner.lock().kv.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, by: i64) -> StoreResult<i64> {
        self.check_available("incr")?;
        let mut inner = self.inner.lock();
        let counter = inner.counters.entry(key.to_string()).or_insert(0);
        *counter += by;
        Ok(*counter)
    }

    async fn stream_append(
        &self,
        stream: &str,
        payload: serde_json::Value,
    ) -> StoreResult<EntryId> {
        self.check_available("stream_append")?;
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let state = inner.streams.entry(stream.to_string()).or_default();
        let id = Self::next_id(state, now);
        state.entries.insert(
            id,
            EntryRecord {
                id,
                stream: stream.to_string(),
                payload,
                status: EntryStatus::Pending,
                retry_count: 0,
                enqueued_at: now,
                last_delivered_at: None,
                not_before: None,
                delivery_deadline: None,
                owning_group: None,
                owning_consumer: None,
                dead_reason: None,
            },
        );
        Ok(id)
    }

    async fn group_create(
        &self,
        group: &str,
        streams: &[String],
        replay: bool,
    ) -> StoreResult<()> {
        self.check_available("group_create")?;
        let mut inner = self.inner.lock();
        for stream in streams {
            inner.streams.entry(stream.clone()).or_default();
        }
        if inner.groups.contains_key(group) {
            return Ok(());
        }
        let cursors = streams
            .iter()
            .map(|s| {
                let cursor = if replay {
                    None
                } else {
                    inner.streams.get(s).and_then(|st| st.last_id)
                };
                (s.clone(), cursor)
            })
            .collect();
        inner.groups.insert(
            group.to_string(),
            GroupState {
                streams: streams.to_vec(),
                cursors,
            },
        );
        Ok(())
    }

    async fn stream_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        now: DateTime<Utc>,
        visibility_timeout: Duration,
    ) -> StoreResult<Vec<EntryRecord>> {
        self.check_available("stream_claim")?;
        let mut inner = self.inner.lock();
        // A group may only claim from streams it was registered over; a missing
        // cursor is the same error either way, matching the Postgres backend.
        let cursor = inner
            .groups
            .get(group)
            .and_then(|g| g.cursors.get(stream).copied())
            .ok_or_else(|| StoreError::UnknownGroup {
                group: group.to_string(),
            })?;

        let deadline = now + chrono::Duration::from_std(visibility_timeout).unwrap_or_default();
        let mut claimed = Vec::new();
        let mut max_pending_id = None;

        if let Some(state) = inner.streams.get_mut(stream) {
            for entry in state.entries.values_mut() {
                if claimed.len() >= count {
                    break;
                }
                if !Self::claimable(entry, group, cursor, now) {
                    continue;
                }
                if entry.status == EntryStatus::Pending {
                    max_pending_id = Some(entry.id);
                }
                entry.status = EntryStatus::Delivered;
                entry.last_delivered_at = Some(now);
                entry.delivery_deadline = Some(deadline);
                entry.owning_group = Some(group.to_string());
                entry.owning_consumer = Some(consumer.to_string());
                entry.not_before = None;
                claimed.push(entry.clone());
            }
        }

        if let Some(max_id) = max_pending_id {
            if let Some(group_state) = inner.groups.get_mut(group) {
                let cursor = group_state.cursors.entry(stream.to_string()).or_default();
                if cursor.map_or(true, |c| max_id > c) {
                    *cursor = Some(max_id);
                }
            }
        }

        Ok(claimed)
    }

    async fn stream_ack(&self, stream: &str, group: &str, id: EntryId) -> StoreResult<bool> {
        self.check_available("stream_ack")?;
        let mut inner = self.inner.lock();
        let Some(entry) = inner
            .streams
            .get_mut(stream)
            .and_then(|s| s.entries.get_mut(&id))
        else {
            return Ok(false);
        };
        let owned_here = entry.owning_group.as_deref() == Some(group);
        if entry.status != EntryStatus::Delivered || !owned_here {
            return Ok(false);
        }
        entry.status = EntryStatus::Acked;
        entry.owning_consumer = None;
        entry.delivery_deadline = None;
        Ok(true)
    }

    async fn expired_deliveries(
        &self,
        stream: &str,
        group: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<EntryRecord>> {
        self.check_available("expired_deliveries")?;
        let inner = self.inner.lock();
        let Some(state) = inner.streams.get(stream) else {
            return Ok(Vec::new());
        };
        Ok(state
            .entries
            .values()
            .filter(|e| {
                e.status == EntryStatus::Delivered
                    && e.owning_group.as_deref() == Some(group)
                    && e.delivery_deadline.is_some_and(|d| d <= now)
            })
            .cloned()
            .collect())
    }

    async fn stream_retry(
        &self,
        stream: &str,
        id: EntryId,
        now: DateTime<Utc>,
        not_before: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.check_available("stream_retry")?;
        let mut inner = self.inner.lock();
        let Some(entry) = inner
            .streams
            .get_mut(stream)
            .and_then(|s| s.entries.get_mut(&id))
        else {
            return Ok(false);
        };
        let expired = entry.status == EntryStatus::Delivered
            && entry.delivery_deadline.is_some_and(|d| d <= now);
        if !expired {
            return Ok(false);
        }
        entry.status = EntryStatus::RetryScheduled;
        entry.retry_count += 1;
        entry.not_before = Some(not_before);
        entry.delivery_deadline = None;
        entry.owning_consumer = None;
        Ok(true)
    }

    async fn stream_dead_letter(
        &self,
        stream: &str,
        id: EntryId,
        now: DateTime<Utc>,
        reason: &str,
    ) -> StoreResult<bool> {
        self.check_available("stream_dead_letter")?;
        let mut inner = self.inner.lock();
        let Some(state) = inner.streams.get_mut(stream) else {
            return Ok(false);
        };
        let expired = state.entries.get(&id).is_some_and(|e| {
            e.status == EntryStatus::Delivered && e.delivery_deadline.is_some_and(|d| d <= now)
        });
        if !expired {
            return Ok(false);
        }
        let mut entry = state.entries.remove(&id).expect("checked above");
        entry.status = EntryStatus::Dead;
        entry.retry_count += 1;
        entry.dead_reason = Some(reason.to_string());
        entry.delivery_deadline = None;
        state.dead.push(entry);
        Ok(true)
    }

    async fn dead_letter_entries(&self, stream: &str) -> StoreResult<Vec<EntryRecord>> {
        self.check_available("dead_letter_entries")?;
        let inner = self.inner.lock();
        Ok(inner
            .streams
            .get(stream)
            .map(|s| s.dead.clone())
            .unwrap_or_default())
    }

    async fn requeue_dead_letter(
        &self,
        stream: &str,
        id: EntryId,
    ) -> StoreResult<Option<EntryId>> {
        self.check_available("requeue_dead_letter")?;
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let Some(state) = inner.streams.get_mut(stream) else {
            return Ok(None);
        };
        let Some(position) = state.dead.iter().position(|e| e.id == id) else {
            return Ok(None);
        };
        let dead = state.dead.remove(position);
        let new_id = Self::next_id(state, now);
        state.entries.insert(
            new_id,
            EntryRecord {
                id: new_id,
                stream: stream.to_string(),
                payload: dead.payload,
                status: EntryStatus::Pending,
                retry_count: 0,
                enqueued_at: now,
                last_delivered_at: None,
                not_before: None,
                delivery_deadline: None,
                owning_group: None,
                owning_consumer: None,
                dead_reason: None,
            },
        );
        Ok(Some(new_id))
    }

    async fn pending_count(&self, stream: &str, group: &str) -> StoreResult<u64> {
        self.check_available("pending_count")?;
        let now = Utc::now();
        let inner = self.inner.lock();
        // Unregistered (group, stream) pairs count zero, as in Postgres.
        let Some(cursor) = inner
            .groups
            .get(group)
            .and_then(|g| g.cursors.get(stream).copied())
        else {
            return Ok(0);
        };
        let Some(state) = inner.streams.get(stream) else {
            return Ok(0);
        };
        Ok(state
            .entries
            .values()
            .filter(|e| Self::claimable(e, group, cursor, now))
            .count() as u64)
    }

    async fn group_list(&self) -> StoreResult<Vec<GroupInfo>> {
        self.check_available("group_list")?;
        let now = Utc::now();
        let inner = self.inner.lock();
        let mut groups = Vec::new();
        for (name, group_state) in &inner.groups {
            let mut pending = 0u64;
            for stream in &group_state.streams {
                let cursor = group_state.cursors.get(stream).copied().flatten();
                if let Some(state) = inner.streams.get(stream) {
                    pending += state
                        .entries
                        .values()
                        .filter(|e| Self::claimable(e, name, cursor, now))
                        .count() as u64;
                }
            }
            groups.push(GroupInfo {
                name: name.clone(),
                streams: group_state.streams.clone(),
                pending,
            });
        }
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }
}
