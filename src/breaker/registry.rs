//! # Circuit Breaker Registry
//!
//! Lazy per-service breaker creation with per-service configuration overrides.
//! Breakers are created on first protected call for a service name; their shared
//! records persist in the store regardless of which process created them.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::config::BreakerSettings;
use crate::store::StateStore;

use super::{BreakerError, BreakerSnapshot, CircuitBreaker};

/// Registry of per-service circuit breakers sharing one store handle
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    store: Arc<dyn StateStore>,
    settings: BreakerSettings,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(store: Arc<dyn StateStore>, settings: BreakerSettings) -> Self {
        Self {
            store,
            settings,
            breakers: DashMap::new(),
        }
    }

    /// Get or lazily create the breaker for a service name.
    pub fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(service) {
            return existing.clone();
        }
        let created = self
            .breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                debug!(service = %service, "creating circuit breaker");
                Arc::new(CircuitBreaker::new(
                    service,
                    self.store.clone(),
                    self.settings.for_service(service),
                ))
            });
        created.clone()
    }

    /// Services with a breaker instantiated in this process.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Read-only snapshots of every instantiated breaker, for status queries.
    pub async fn status_snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();
        let mut snapshots = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            if let Ok(snapshot) = breaker.snapshot().await {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by(|a, b| a.service.cmp(&b.service));
        snapshots
    }

    /// Administrative: force one service's breaker open.
    pub async fn force_open(&self, service: &str) -> Result<(), BreakerError> {
        self.breaker(service).force_open().await
    }

    /// Administrative: reset one service's breaker to CLOSED.
    pub async fn reset(&self, service: &str) -> Result<(), BreakerError> {
        self.breaker(service).reset().await
    }
}
