//! # Health Monitoring and Recovery
//!
//! Periodic probing of downstream services with three-level classification
//! (HEALTHY, DEGRADED, UNHEALTHY), persisted per-service health records in the
//! shared store, and a recovery manager that converts confirmed health back
//! into circuit breaker recovery by expiring open recovery windows early.

pub mod checker;
pub mod monitor;
pub mod recovery;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::breaker::BreakerError;
use crate::store::StoreError;

pub use checker::{FnProbe, HealthChecker, Observation, ServiceProbe};
pub use monitor::HealthMonitor;
pub use recovery::RecoveryManager;

/// Health subsystem failures
#[derive(Debug, Error)]
pub enum HealthError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Breaker(#[from] BreakerError),

    #[error("serialization error: {message}")]
    Serialization { message: String },

    #[error("no health checker registered for service: {service}")]
    UnknownService { service: String },
}

/// Three-level health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Probe succeeded within latency expectations
    Healthy,
    /// Probe succeeded but slower than the degraded-latency threshold
    Degraded,
    /// Probe failed or timed out
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Per-service health record persisted at `health:{service}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub service: String,
    pub status: HealthStatus,
    pub last_checked_at: DateTime<Utc>,
    pub response_time_ms: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Probe error detail when UNHEALTHY
    pub detail: Option<String>,
}
