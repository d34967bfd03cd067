//! # Health Monitor
//!
//! Owns the registered checkers, runs probe rounds on the configured interval,
//! persists per-service [`HealthRecord`]s in the shared store (key
//! `health:{service}`), and feeds observations to the recovery manager.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::try_join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::HealthSettings;
use crate::store::{StateStore, StoreError};

use super::checker::HealthChecker;
use super::recovery::RecoveryManager;
use super::{HealthError, HealthRecord, HealthStatus};

#[derive(Debug)]
pub struct HealthMonitor {
    store: Arc<dyn StateStore>,
    settings: HealthSettings,
    checkers: DashMap<String, Arc<HealthChecker>>,
    recovery: Option<Arc<RecoveryManager>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn StateStore>, settings: HealthSettings) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            store,
            settings,
            checkers: DashMap::new(),
            recovery: None,
            shutdown_tx,
        }
    }

    /// Attach a recovery manager so confirmed health can reopen circuits early.
    pub fn with_recovery(mut self, recovery: Arc<RecoveryManager>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn register(&self, checker: HealthChecker) {
        let service = checker.service().to_string();
        info!(service = %service, "🩺 HEALTH: checker registered");
        self.checkers.insert(service, Arc::new(checker));
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.checkers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Probe one service now and persist the updated record.
    pub async fn check_service(&self, service: &str) -> Result<HealthRecord, HealthError> {
        let checker = self
            .checkers
            .get(service)
            .map(|c| c.value().clone())
            .ok_or_else(|| HealthError::UnknownService {
                service: service.to_string(),
            })?;

        let observation = checker.check_once().await;
        let previous = self.load_record(service).await?;

        let (consecutive_failures, consecutive_successes) = match observation.status {
            HealthStatus::Unhealthy => (
                previous.as_ref().map_or(1, |p| p.consecutive_failures.saturating_add(1)),
                0,
            ),
            _ => (
                0,
                previous.as_ref().map_or(1, |p| p.consecutive_successes.saturating_add(1)),
            ),
        };

        let record = HealthRecord {
            service: service.to_string(),
            status: observation.status,
            last_checked_at: Utc::now(),
            response_time_ms: observation.response_time.as_millis() as u64,
            consecutive_failures,
            consecutive_successes,
            detail: observation.detail,
        };
        self.save_record(&record).await?;

        if record.status == HealthStatus::Unhealthy {
            warn!(
                service = %service,
                consecutive_failures = record.consecutive_failures,
                detail = record.detail.as_deref().unwrap_or(""),
                "🔴 HEALTH: service unhealthy"
            );
        }

        if let Some(recovery) = &self.recovery {
            recovery.observe(service, record.status).await?;
        }

        Ok(record)
    }

    /// Probe every registered service once. Probes run concurrently so one
    /// slow service cannot delay its siblings' checks within the round.
    pub async fn check_all(&self) -> Result<Vec<HealthRecord>, HealthError> {
        let probes = self
            .services()
            .into_iter()
            .map(|service| async move { self.check_service(&service).await });
        try_join_all(probes).await
    }

    /// Last persisted records for the registered services, without probing.
    pub async fn health_report(&self) -> Result<Vec<HealthRecord>, HealthError> {
        let mut records = Vec::new();
        for service in self.services() {
            if let Some(record) = self.load_record(&service).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Spawn the periodic probe loop. Runs until [`stop`](Self::stop).
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.settings.check_interval();
        info!(
            interval_secs = interval.as_secs(),
            services = monitor.checkers.len(),
            "🩺 HEALTH: monitor loop starting"
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = monitor.check_all().await {
                            warn!(error = %e, "health probe round failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("🩺 HEALTH: monitor loop stopping");
                        break;
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    async fn load_record(&self, service: &str) -> Result<Option<HealthRecord>, HealthError> {
        let key = format!("health:{service}");
        match self.store.get(&key).await? {
            Some(versioned) => {
                let record = serde_json::from_value(versioned.value).map_err(|e| {
                    HealthError::Serialization {
                        message: e.to_string(),
                    }
                })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn save_record(&self, record: &HealthRecord) -> Result<(), HealthError> {
        let key = format!("health:{}", record.service);
        let value = serde_json::to_value(record).map_err(|e| {
            HealthError::from(StoreError::serialization(e.to_string()))
        })?;
        self.store.put(&key, value).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use crate::store::MemoryStateStore;

    fn settings() -> HealthSettings {
        HealthSettings {
            check_interval_seconds: 1,
            probe_timeout_ms: 200,
            degraded_latency_ms: 100,
            ..HealthSettings::default()
        }
    }

    #[tokio::test]
    async fn test_consecutive_failures_accumulate_and_reset() {
        let store = Arc::new(MemoryStateStore::new());
        let monitor = HealthMonitor::new(store, settings());
        let flaky = Arc::new(AtomicU32::new(0));
        let probe_state = flaky.clone();
        monitor.register(HealthChecker::from_fn("svc", &settings(), move || {
            let calls = probe_state.fetch_add(1, Ordering::SeqCst);
            async move {
                if calls < 2 {
                    Err("down".to_string())
                } else {
                    Ok(())
                }
            }
        }));

        let first = monitor.check_service("svc").await.unwrap();
        assert_eq!(first.status, HealthStatus::Unhealthy);
        assert_eq!(first.consecutive_failures, 1);

        let second = monitor.check_service("svc").await.unwrap();
        assert_eq!(second.consecutive_failures, 2);

        let third = monitor.check_service("svc").await.unwrap();
        assert_eq!(third.status, HealthStatus::Healthy);
        assert_eq!(third.consecutive_failures, 0);
        assert_eq!(third.consecutive_successes, 1);
    }

    #[tokio::test]
    async fn test_records_persist_in_store_for_reporting() {
        let store = Arc::new(MemoryStateStore::new());
        let monitor = HealthMonitor::new(store, settings());
        monitor.register(HealthChecker::from_fn("a", &settings(), || async { Ok(()) }));
        monitor.register(HealthChecker::from_fn("b", &settings(), || async {
            Err("gone".to_string())
        }));

        monitor.check_all().await.unwrap();
        let report = monitor.health_report().await.unwrap();
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].service, "a");
        assert_eq!(report[0].status, HealthStatus::Healthy);
        assert_eq!(report[1].status, HealthStatus::Unhealthy);
        assert_eq!(report[1].detail.as_deref(), Some("gone"));
    }

    #[tokio::test]
    async fn test_check_all_probes_concurrently() {
        let store = Arc::new(MemoryStateStore::new());
        let monitor = HealthMonitor::new(store, settings());
        for name in ["a", "b", "c"] {
            monitor.register(HealthChecker::from_fn(name, &settings(), || async {
                tokio::time::sleep(Duration::from_millis(80)).await;
                Ok(())
            }));
        }

        let started = tokio::time::Instant::now();
        let records = monitor.check_all().await.unwrap();
        assert_eq!(records.len(), 3);
        // Sequential probing would take at least 240ms here.
        assert!(
            started.elapsed() < Duration::from_millis(200),
            "probes should overlap"
        );
    }

    #[tokio::test]
    async fn test_unknown_service_is_an_error() {
        let monitor = HealthMonitor::new(Arc::new(MemoryStateStore::new()), settings());
        assert!(matches!(
            monitor.check_service("missing").await,
            Err(HealthError::UnknownService { .. })
        ));
    }

    #[tokio::test]
    async fn test_monitor_loop_start_and_stop() {
        let monitor = Arc::new(HealthMonitor::new(
            Arc::new(MemoryStateStore::new()),
            settings(),
        ));
        monitor.register(HealthChecker::from_fn("svc", &settings(), || async { Ok(()) }));

        let handle = monitor.start();
        // First tick fires immediately.
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should stop promptly")
            .unwrap();

        assert_eq!(monitor.health_report().await.unwrap().len(), 1);
    }
}
