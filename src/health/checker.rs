//! # Health Checker
//!
//! Wraps one service probe with a timeout and latency classification. A probe
//! answers "did the dependency respond, and how fast" — the checker turns that
//! into a [`HealthStatus`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::debug;

use crate::config::HealthSettings;

use super::HealthStatus;

/// A single health probe against one downstream dependency.
///
/// Return `Ok(())` when the dependency answered, `Err(detail)` when it did not.
/// The checker handles timing and timeout; probes should not race their own.
#[async_trait]
pub trait ServiceProbe: Send + Sync {
    async fn probe(&self) -> Result<(), String>;
}

/// Adapter turning an async closure into a [`ServiceProbe`]
pub struct FnProbe {
    inner: Box<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>,
}

impl FnProbe {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        Self {
            inner: Box::new(move || Box::pin(f())),
        }
    }
}

#[async_trait]
impl ServiceProbe for FnProbe {
    async fn probe(&self) -> Result<(), String> {
        (self.inner)().await
    }
}

/// Outcome of one probe round
#[derive(Debug, Clone)]
pub struct Observation {
    pub status: HealthStatus,
    pub response_time: Duration,
    pub detail: Option<String>,
}

/// One service's probe plus its timeout and latency thresholds
pub struct HealthChecker {
    service: String,
    probe: Arc<dyn ServiceProbe>,
    probe_timeout: Duration,
    degraded_latency: Duration,
}

impl fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthChecker")
            .field("service", &self.service)
            .field("probe_timeout", &self.probe_timeout)
            .field("degraded_latency", &self.degraded_latency)
            .finish()
    }
}

impl HealthChecker {
    pub fn new(
        service: impl Into<String>,
        probe: Arc<dyn ServiceProbe>,
        settings: &HealthSettings,
    ) -> Self {
        Self {
            service: service.into(),
            probe,
            probe_timeout: settings.probe_timeout(),
            degraded_latency: settings.degraded_latency(),
        }
    }

    /// Convenience constructor from an async closure.
    pub fn from_fn<F, Fut>(
        service: impl Into<String>,
        settings: &HealthSettings,
        f: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        Self::new(service, Arc::new(FnProbe::new(f)), settings)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Run the probe once: timeout and failures are UNHEALTHY, slow successes
    /// DEGRADED, everything else HEALTHY.
    pub async fn check_once(&self) -> Observation {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.probe_timeout, self.probe.probe()).await;
        let response_time = started.elapsed();

        let (status, detail) = match outcome {
            Ok(Ok(())) if response_time > self.degraded_latency => (HealthStatus::Degraded, None),
            Ok(Ok(())) => (HealthStatus::Healthy, None),
            Ok(Err(detail)) => (HealthStatus::Unhealthy, Some(detail)),
            Err(_) => (
                HealthStatus::Unhealthy,
                Some(format!("probe timed out after {:?}", self.probe_timeout)),
            ),
        };

        debug!(
            service = %self.service,
            status = %status,
            response_time_ms = response_time.as_millis() as u64,
            "🩺 HEALTH: probe completed"
        );

        Observation {
            status,
            response_time,
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(timeout_ms: u64, degraded_ms: u64) -> HealthSettings {
        HealthSettings {
            probe_timeout_ms: timeout_ms,
            degraded_latency_ms: degraded_ms,
            ..HealthSettings::default()
        }
    }

    #[tokio::test]
    async fn test_fast_success_is_healthy() {
        let checker = HealthChecker::from_fn("svc", &settings(1_000, 500), || async { Ok(()) });
        let obs = checker.check_once().await;
        assert_eq!(obs.status, HealthStatus::Healthy);
        assert!(obs.detail.is_none());
    }

    #[tokio::test]
    async fn test_slow_success_is_degraded() {
        let checker = HealthChecker::from_fn("svc", &settings(1_000, 10), || async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(())
        });
        let obs = checker.check_once().await;
        assert_eq!(obs.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_failure_is_unhealthy_with_detail() {
        let checker = HealthChecker::from_fn("svc", &settings(1_000, 500), || async {
            Err("connection refused".to_string())
        });
        let obs = checker.check_once().await;
        assert_eq!(obs.status, HealthStatus::Unhealthy);
        assert_eq!(obs.detail.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn test_timeout_is_unhealthy() {
        let checker = HealthChecker::from_fn("svc", &settings(20, 10), || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        let obs = checker.check_once().await;
        assert_eq!(obs.status, HealthStatus::Unhealthy);
        assert!(obs.detail.unwrap().contains("timed out"));
    }
}
