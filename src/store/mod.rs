//! # Durable State Store
//!
//! Every piece of cross-process state — breaker records, health records, stream
//! entries, and consumer-group cursors — lives behind the [`StateStore`] trait.
//! There is no in-process source of truth: mutations that must be atomic across
//! processes (breaker transitions, claim assignment, ack) are single atomic
//! operations at the backend, never caller-side read-modify-write.
//!
//! Two backends ship with the crate:
//!
//! - [`PgStateStore`]: the production backend over PostgreSQL via sqlx
//! - [`MemoryStateStore`]: a single-process backend used by tests and as the
//!   circuit breaker's local degraded mode when the shared store is unreachable

pub mod memory;
pub mod postgres;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryStateStore;
pub use postgres::PgStateStore;

/// Errors raised by state store backends
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend cannot be reached. A first-class failure mode: callers decide
    /// between fail-open and fail-closed, the store never guesses.
    #[error("state store unavailable during {operation}: {message}")]
    Unavailable { operation: String, message: String },

    #[error("serialization error: {message}")]
    Serialization { message: String },

    #[error("unknown consumer group: {group}")]
    UnknownGroup { group: String },
}

impl StoreError {
    pub fn unavailable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Stream entry identifier: milliseconds since the epoch plus a per-stream
/// sequence, strictly increasing within a stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EntryId {
    pub millis: i64,
    pub seq: u64,
}

impl EntryId {
    pub fn new(millis: i64, seq: u64) -> Self {
        Self { millis, seq }
    }
}

// Wire format mirrors the familiar "<millis>-<seq>" stream-id notation.
impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (millis, seq) = s
            .split_once('-')
            .ok_or_else(|| format!("malformed entry id: {s}"))?;
        Ok(Self {
            millis: millis
                .parse()
                .map_err(|e| format!("malformed entry id {s}: {e}"))?,
            seq: seq
                .parse()
                .map_err(|e| format!("malformed entry id {s}: {e}"))?,
        })
    }
}

/// Delivery status of a stream entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Delivered,
    Acked,
    RetryScheduled,
    Dead,
}

/// One durable stream entry plus its delivery bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRecord {
    pub id: EntryId,
    pub stream: String,
    pub payload: serde_json::Value,
    pub status: EntryStatus,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub last_delivered_at: Option<DateTime<Utc>>,
    /// Earliest instant the entry may be claimed again (backoff gate)
    pub not_before: Option<DateTime<Utc>>,
    /// Instant an in-flight delivery expires and becomes reclaimable
    pub delivery_deadline: Option<DateTime<Utc>>,
    pub owning_group: Option<String>,
    pub owning_consumer: Option<String>,
    pub dead_reason: Option<String>,
}

/// A value plus the version counter used for compare-and-set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: serde_json::Value,
    pub version: u64,
}

/// Consumer group metadata for the reclaimer and observability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInfo {
    pub name: String,
    pub streams: Vec<String>,
    pub pending: u64,
}

/// Durable key/value + counter + stream primitives shared by all processes.
///
/// Implementations must make each method atomic at the backend; concurrent
/// callers racing on the same key/entry observe exactly one winner.
#[async_trait]
pub trait StateStore: Send + Sync + fmt::Debug {
    // --- key/value with optimistic concurrency ---

    async fn get(&self, key: &str) -> StoreResult<Option<VersionedValue>>;

    /// Unconditional write; returns the new version.
    async fn put(&self, key: &str, value: serde_json::Value) -> StoreResult<u64>;

    /// Compare-and-set: writes only if the stored version equals
    /// `expected_version` (0 means "insert only if absent"). Returns whether the
    /// write won.
    async fn put_if_version(
        &self,
        key: &str,
        value: serde_json::Value,
        expected_version: u64,
    ) -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    // --- atomic counters ---

    async fn incr(&self, key: &str, by: i64) -> StoreResult<i64>;

    // --- durable streams ---

    /// Append a PENDING entry; ids are strictly increasing within the stream.
    async fn stream_append(
        &self,
        stream: &str,
        payload: serde_json::Value,
    ) -> StoreResult<EntryId>;

    /// Idempotently create a consumer group over the given streams. With
    /// `replay` false the group's cursors start at "new entries only".
    async fn group_create(&self, group: &str, streams: &[String], replay: bool)
        -> StoreResult<()>;

    /// Atomically claim up to `count` claimable entries for `consumer`:
    /// PENDING entries past the group cursor plus this group's RETRY_SCHEDULED
    /// entries whose `not_before` has elapsed. Claimed entries become DELIVERED
    /// with a delivery deadline of `now + visibility_timeout`.
    async fn stream_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        now: DateTime<Utc>,
        visibility_timeout: Duration,
    ) -> StoreResult<Vec<EntryRecord>>;

    /// Ack a delivered entry for this group. Idempotent: returns false when the
    /// entry is unknown, already acked, or owned by another group.
    async fn stream_ack(&self, stream: &str, group: &str, id: EntryId) -> StoreResult<bool>;

    /// DELIVERED entries of this group whose delivery deadline has passed.
    async fn expired_deliveries(
        &self,
        stream: &str,
        group: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<EntryRecord>>;

    /// Conditional transition expired-DELIVERED → RETRY_SCHEDULED, incrementing
    /// `retry_count` and setting the backoff gate. Returns false if the entry is
    /// no longer in the expired-DELIVERED state (another pass won, or it was
    /// acked in the meantime).
    async fn stream_retry(
        &self,
        stream: &str,
        id: EntryId,
        now: DateTime<Utc>,
        not_before: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Conditional transition expired-DELIVERED → DEAD, moving the entry to the
    /// stream's dead-letter side and out of the live pending set. Returns false
    /// if another pass won the race.
    async fn stream_dead_letter(
        &self,
        stream: &str,
        id: EntryId,
        now: DateTime<Utc>,
        reason: &str,
    ) -> StoreResult<bool>;

    /// Dead-lettered entries for a stream, newest last, with full retry history.
    async fn dead_letter_entries(&self, stream: &str) -> StoreResult<Vec<EntryRecord>>;

    /// Re-inject a dead-lettered entry as a fresh PENDING entry with a reset
    /// retry count. Returns the new id, or None if the entry is not dead.
    async fn requeue_dead_letter(
        &self,
        stream: &str,
        id: EntryId,
    ) -> StoreResult<Option<EntryId>>;

    /// Count of claimable (PENDING / due RETRY_SCHEDULED) entries for a group.
    async fn pending_count(&self, stream: &str, group: &str) -> StoreResult<u64>;

    /// All registered consumer groups.
    async fn group_list(&self) -> StoreResult<Vec<GroupInfo>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_id_ordering_and_wire_format() {
        let a = EntryId::new(1_700_000_000_000, 0);
        let b = EntryId::new(1_700_000_000_000, 1);
        let c = EntryId::new(1_700_000_000_001, 0);
        assert!(a < b);
        assert!(b < c);

        let rendered = b.to_string();
        assert_eq!(rendered, "1700000000000-1");
        assert_eq!(rendered.parse::<EntryId>().unwrap(), b);
    }

    #[test]
    fn test_entry_id_rejects_malformed_input() {
        assert!("not-an-id-at-all".parse::<EntryId>().is_err());
        assert!("12345".parse::<EntryId>().is_err());
    }
}
