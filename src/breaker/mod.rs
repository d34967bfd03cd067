//! # Circuit Breaker Subsystem
//!
//! Per-service circuit breakers whose state lives in the shared
//! [`StateStore`](crate::store::StateStore), so every process protecting the same
//! downstream service observes the same CLOSED/OPEN/HALF_OPEN state machine.
//! State transitions are compare-and-set operations on a versioned store record;
//! when probes race out of HALF_OPEN, exactly one process's outcome wins.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use relay_core::breaker::CircuitBreakerRegistry;
//! use relay_core::config::BreakerSettings;
//! use relay_core::store::MemoryStateStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStateStore::new());
//! let registry = CircuitBreakerRegistry::new(store, BreakerSettings::default());
//!
//! let breaker = registry.breaker("vector_store");
//! let result = breaker
//!     .call(|| async { Ok::<_, String>("embedding response") })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod registry;

pub use circuit_breaker::{
    BreakerError, BreakerRecord, BreakerSnapshot, CallError, CallPermit, CircuitBreaker,
    CircuitState,
};
pub use registry::CircuitBreakerRegistry;
