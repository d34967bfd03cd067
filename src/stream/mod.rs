//! # Durable Streams and Reliable Delivery
//!
//! Append-only streams with consumer groups, explicit acks, visibility-timeout
//! redelivery, exponential backoff between attempts, and dead-letter quarantine
//! once the retry budget is spent. Every entry is durable from the moment
//! `enqueue` returns; nothing is lost to a consumer crash.

pub mod dead_letter;
pub mod delivery;
pub mod manager;

use thiserror::Error;

use crate::store::StoreError;

pub use dead_letter::DeadLetterQueue;
pub use delivery::{DeliveryTracker, ReclaimSummary};
pub use manager::{consumer_name, StreamManager};

/// Stream subsystem failures. Unknown streams/groups and backend outages all
/// originate at the store and carry its structured error.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Store(#[from] StoreError),
}
