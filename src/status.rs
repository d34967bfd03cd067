//! # Status Reporting
//!
//! One read-only report across the resilience and delivery subsystems: every
//! breaker's state, the latest persisted health records, and consumer-group
//! backlogs. Built for operator dashboards and admin endpoints; queries never
//! mutate anything.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::breaker::{BreakerSnapshot, CircuitBreakerRegistry};
use crate::error::Result;
use crate::health::{HealthMonitor, HealthRecord};
use crate::store::GroupInfo;
use crate::stream::StreamManager;

/// Point-in-time view of the whole relay
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub breakers: Vec<BreakerSnapshot>,
    pub health: Vec<HealthRecord>,
    pub groups: Vec<GroupInfo>,
}

impl StatusReport {
    /// True when no breaker is open and no service is unhealthy.
    pub fn all_clear(&self) -> bool {
        use crate::breaker::CircuitState;
        use crate::health::HealthStatus;
        self.breakers.iter().all(|b| b.state == CircuitState::Closed)
            && self.health.iter().all(|h| h.status != HealthStatus::Unhealthy)
    }
}

/// Gathers a [`StatusReport`] from whichever subsystems are wired in
#[derive(Debug, Default)]
pub struct StatusCollector {
    registry: Option<Arc<CircuitBreakerRegistry>>,
    monitor: Option<Arc<HealthMonitor>>,
    streams: Option<Arc<StreamManager>>,
}

impl StatusCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_breakers(mut self, registry: Arc<CircuitBreakerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_health(mut self, monitor: Arc<HealthMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_streams(mut self, streams: Arc<StreamManager>) -> Self {
        self.streams = Some(streams);
        self
    }

    pub async fn report(&self) -> Result<StatusReport> {
        let breakers = match &self.registry {
            Some(registry) => registry.status_snapshot().await,
            None => Vec::new(),
        };
        let health = match &self.monitor {
            Some(monitor) => monitor.health_report().await?,
            None => Vec::new(),
        };
        let groups = match &self.streams {
            Some(streams) => streams.groups().await?,
            None => Vec::new(),
        };
        Ok(StatusReport {
            generated_at: Utc::now(),
            breakers,
            health,
            groups,
        })
    }
}
