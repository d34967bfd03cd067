//! # Relay Core
//!
//! Resilience and reliable-delivery layer for distributed services: shared-state
//! circuit breakers, health monitoring with automated recovery, graceful
//! degradation, and durable streams with consumer groups, ack-based
//! at-least-once delivery, exponential-backoff retry, and dead-letter
//! quarantine.
//!
//! ## Architecture
//!
//! All cross-process state lives behind the [`store::StateStore`] trait; the
//! production backend is PostgreSQL ([`store::PgStateStore`]), with
//! [`store::MemoryStateStore`] for tests and degraded-mode operation. Nothing
//! is process-local: every breaker transition is a compare-and-set on a shared
//! versioned record, and every stream claim is a single atomic operation at the
//! backend, so any number of processes can cooperate without split-brain.
//!
//! - [`breaker`]: three-state circuit breakers shared across processes, with
//!   typed rejections and configurable fail-open/fail-closed store outage policy
//! - [`health`]: periodic service probing, persisted health records, and early
//!   breaker recovery after confirmed health
//! - [`degradation`]: per-service fallback strategies serving explicit degraded
//!   responses when circuits reject
//! - [`stream`]: durable streams, consumer groups, visibility-timeout
//!   redelivery, and dead-letter quarantine
//! - [`status`]: read-only reporting across all subsystems
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use relay_core::breaker::CircuitBreakerRegistry;
//! use relay_core::config::ConfigManager;
//! use relay_core::store::MemoryStateStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let store = Arc::new(MemoryStateStore::new());
//! let registry = CircuitBreakerRegistry::new(store, manager.config().breaker.clone());
//!
//! let breaker = registry.breaker("search");
//! let result = breaker
//!     .call(|| async { Ok::<_, String>("hit") })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod breaker;
pub mod config;
pub mod degradation;
pub mod error;
pub mod health;
pub mod logging;
pub mod status;
pub mod store;
pub mod stream;

pub use breaker::{BreakerError, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use config::{ConfigManager, RelayConfig};
pub use degradation::{DegradationManager, FallbackStrategy};
pub use error::{RelayError, Result};
pub use health::{HealthMonitor, HealthStatus, RecoveryManager};
pub use logging::init_structured_logging;
pub use status::{StatusCollector, StatusReport};
pub use store::{MemoryStateStore, PgStateStore, StateStore};
pub use stream::{DeadLetterQueue, DeliveryTracker, StreamManager};
