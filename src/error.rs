//! # Crate-Level Error Types
//!
//! Umbrella error for callers that compose multiple subsystems. Each subsystem
//! keeps its own structured `thiserror` enum; this type exists so applications can
//! bubble any relay failure through one `Result` alias.

use thiserror::Error;

use crate::breaker::BreakerError;
use crate::config::ConfigError;
use crate::health::HealthError;
use crate::store::StoreError;
use crate::stream::StreamError;

/// Top-level error covering every relay subsystem
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Breaker(#[from] BreakerError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Health(#[from] HealthError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, RelayError>;
