//! # Recovery Manager
//!
//! Converts confirmed downstream health back into circuit availability. A
//! streak of consecutive HEALTHY observations at or above the configured
//! confirmation count expires the service's open recovery window early, so the
//! next protected call probes immediately instead of waiting out the clock.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::breaker::CircuitBreakerRegistry;
use crate::config::HealthSettings;

use super::{HealthError, HealthStatus};

#[derive(Debug)]
pub struct RecoveryManager {
    registry: Arc<CircuitBreakerRegistry>,
    confirmations: u32,
    early_recovery: bool,
    streaks: DashMap<String, u32>,
}

impl RecoveryManager {
    pub fn new(registry: Arc<CircuitBreakerRegistry>, settings: &HealthSettings) -> Self {
        Self {
            registry,
            confirmations: settings.recovery_confirmations.max(1),
            early_recovery: settings.early_recovery,
            streaks: DashMap::new(),
        }
    }

    /// Feed one health observation. Returns whether a breaker window was
    /// expired as a result.
    pub async fn observe(
        &self,
        service: &str,
        status: HealthStatus,
    ) -> Result<bool, HealthError> {
        if status != HealthStatus::Healthy {
            self.streaks.insert(service.to_string(), 0);
            return Ok(false);
        }

        let streak = {
            let mut entry = self.streaks.entry(service.to_string()).or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
        };

        if !self.early_recovery || streak < self.confirmations {
            return Ok(false);
        }

        let expired = self.registry.breaker(service).expire_recovery_window().await?;
        if expired {
            info!(
                service = %service,
                confirmations = streak,
                "✅ RECOVERY: confirmed health, expired breaker recovery window"
            );
        }
        Ok(expired)
    }

    /// Current confirmed-health streak for a service.
    pub fn streak(&self, service: &str) -> u32 {
        self.streaks.get(service).map(|s| *s).unwrap_or(0)
    }
}
