//! # Shared-State Circuit Breaker
//!
//! Classic three-state breaker (Closed, Open, Half-Open) with one twist: the
//! state record is shared across processes through the durable store, and every
//! transition is a compare-and-set on that record's version. "Circuit open" is a
//! typed rejection value carrying a retry-after hint, not an exception used for
//! control flow.
//!
//! When the store itself is unreachable the breaker degrades to a process-local
//! in-memory record running the same state machine (fail-open, the default) or
//! rejects outright (fail-closed), per configuration, and re-adopts the shared
//! record as soon as the store answers again.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::{ResolvedBreakerSettings, StoreFailurePolicy};
use crate::store::{MemoryStateStore, StateStore, StoreError, StoreResult};

/// CAS attempts before a transition gives up under heavy contention
const MAX_CAS_ATTEMPTS: u32 = 16;

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - all calls rejected without touching the downstream
    Open,
    /// Testing recovery - limited probe calls allowed
    HalfOpen,
}

/// The shared, versioned record persisted per service name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_probe_count: u32,
    /// When the current half-open probe batch was admitted. A batch older than
    /// `recovery_timeout` with no recorded outcome is considered abandoned
    /// (probe holder crashed) and its slots become re-claimable.
    #[serde(default)]
    pub probe_started_at: Option<DateTime<Utc>>,
}

impl BreakerRecord {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            opened_at: None,
            half_open_probe_count: 0,
            probe_started_at: None,
        }
    }
}

/// Typed breaker rejections surfaced to callers
#[derive(Debug, Error)]
pub enum BreakerError {
    /// Circuit is open; retry after the remaining recovery window
    #[error("circuit open for {service}, retry after {retry_after:?}")]
    CircuitOpen {
        service: String,
        retry_after: Duration,
    },

    /// Store unreachable and policy is fail-closed
    #[error("state store unavailable for breaker {service}: {message}")]
    StoreUnavailable { service: String, message: String },
}

/// Error type of the [`CircuitBreaker::call`] convenience wrapper
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The breaker rejected the call before the operation ran
    #[error(transparent)]
    Rejected(#[from] BreakerError),

    /// The operation ran and failed; the failure has been recorded
    #[error("operation failed: {0}")]
    Operation(E),
}

/// Proof that `allow()` admitted a call, carrying the state that admitted it
#[derive(Debug, Clone, Copy)]
pub struct CallPermit {
    pub state: CircuitState,
}

/// Read-only view of one breaker for status queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_probe_count: u32,
    /// True while the breaker is running on its process-local record because
    /// the shared store is unreachable
    pub degraded: bool,
}

enum AllowDecision {
    Admit(CircuitState),
    Reject { retry_after: Duration },
}

/// Per-service circuit breaker over the shared state store
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    key: String,
    settings: ResolvedBreakerSettings,
    store: Arc<dyn StateStore>,
    /// Process-local record for degraded mode when the shared store is down
    local: MemoryStateStore,
    degraded: AtomicBool,
    retry_backoff: BackoffPolicy,
}

impl CircuitBreaker {
    pub fn new(
        service: impl Into<String>,
        store: Arc<dyn StateStore>,
        settings: ResolvedBreakerSettings,
    ) -> Self {
        let service = service.into();
        info!(
            service = %service,
            failure_threshold = settings.failure_threshold,
            recovery_timeout_secs = settings.recovery_timeout.as_secs(),
            half_open_max_calls = settings.half_open_max_calls,
            "🛡️ BREAKER: circuit breaker initialized"
        );
        let retry_backoff = BackoffPolicy::new(
            settings.store_retry_base,
            settings.store_retry_base * 8,
        );
        Self {
            key: format!("breaker:{service}"),
            service,
            settings,
            store,
            local: MemoryStateStore::new(),
            degraded: AtomicBool::new(false),
            retry_backoff,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Decide whether a call may proceed. An `Ok` permit means go; the typed
    /// `CircuitOpen` rejection carries the remaining recovery window.
    pub async fn allow(&self) -> Result<CallPermit, BreakerError> {
        let decision = self.run_allow().await?;
        match decision {
            AllowDecision::Admit(state) => Ok(CallPermit { state }),
            AllowDecision::Reject { retry_after } => Err(BreakerError::CircuitOpen {
                service: self.service.clone(),
                retry_after,
            }),
        }
    }

    /// Record a successful downstream call.
    pub async fn record_success(&self) -> Result<(), BreakerError> {
        self.run_success().await
    }

    /// Record a failed downstream call.
    pub async fn record_failure(&self) -> Result<(), BreakerError> {
        self.run_failure().await
    }

    /// Execute an operation under breaker protection, recording its outcome.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _permit = self.allow().await?;
        match operation().await {
            Ok(value) => {
                if let Err(e) = self.record_success().await {
                    warn!(service = %self.service, error = %e, "breaker bookkeeping failed after success");
                }
                Ok(value)
            }
            Err(e) => {
                if let Err(book) = self.record_failure().await {
                    warn!(service = %self.service, error = %book, "breaker bookkeeping failed after failure");
                }
                Err(CallError::Operation(e))
            }
        }
    }

    /// Pull the recovery deadline forward so the next `allow()` may probe
    /// immediately. Used by the recovery manager after confirmed health.
    /// Returns whether the breaker was open and got its window expired.
    pub async fn expire_recovery_window(&self) -> Result<bool, BreakerError> {
        self.run_expire().await
    }

    /// Administrative: force the breaker open immediately.
    pub async fn force_open(&self) -> Result<(), BreakerError> {
        warn!(service = %self.service, "🚨 BREAKER: forced open");
        self.run_force_open().await
    }

    /// Administrative: reset to a fresh CLOSED record.
    pub async fn reset(&self) -> Result<(), BreakerError> {
        warn!(service = %self.service, "🚨 BREAKER: administrative reset");
        self.run_reset().await
    }

    /// Read-only snapshot of the current shared (or degraded-local) record.
    pub async fn snapshot(&self) -> Result<BreakerSnapshot, BreakerError> {
        let record = self.run_snapshot().await?;
        Ok(BreakerSnapshot {
            service: self.service.clone(),
            state: record.state,
            failure_count: record.failure_count,
            success_count: record.success_count,
            last_failure_at: record.last_failure_at,
            opened_at: record.opened_at,
            half_open_probe_count: record.half_open_probe_count,
            degraded: self.degraded.load(Ordering::SeqCst),
        })
    }

    /// Current state, defaulting to Closed when no record exists yet.
    pub async fn state(&self) -> Result<CircuitState, BreakerError> {
        Ok(self.snapshot().await?.state)
    }

    // --- shared-store plumbing -------------------------------------------------

    async fn load(
        &self,
        store: &dyn StateStore,
    ) -> StoreResult<(BreakerRecord, u64)> {
        match store.get(&self.key).await? {
            Some(versioned) => {
                let record = serde_json::from_value(versioned.value)
                    .map_err(|e| StoreError::serialization(e.to_string()))?;
                Ok((record, versioned.version))
            }
            None => Ok((BreakerRecord::new(&self.service), 0)),
        }
    }

    async fn save_if(
        &self,
        store: &dyn StateStore,
        record: &BreakerRecord,
        expected_version: u64,
    ) -> StoreResult<bool> {
        let value = serde_json::to_value(record)
            .map_err(|e| StoreError::serialization(e.to_string()))?;
        store.put_if_version(&self.key, value, expected_version).await
    }

    // --- state machine, executed against whichever store is active ------------

    async fn allow_on(&self, store: &dyn StateStore) -> StoreResult<AllowDecision> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (mut record, version) = self.load(store).await?;
            match record.state {
                CircuitState::Closed => return Ok(AllowDecision::Admit(CircuitState::Closed)),
                CircuitState::Open => {
                    let opened_at = record.opened_at.unwrap_or_else(Utc::now);
                    let elapsed = (Utc::now() - opened_at)
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    if elapsed < self.settings.recovery_timeout {
                        return Ok(AllowDecision::Reject {
                            retry_after: self.settings.recovery_timeout - elapsed,
                        });
                    }
                    // Recovery window elapsed: this call becomes the first probe.
                    record.state = CircuitState::HalfOpen;
                    record.half_open_probe_count = 1;
                    record.probe_started_at = Some(Utc::now());
                    if self.save_if(store, &record, version).await? {
                        info!(service = %self.service, "🟡 BREAKER: half-open (testing recovery)");
                        return Ok(AllowDecision::Admit(CircuitState::HalfOpen));
                    }
                    // Lost the CAS race; another process decided. Re-read.
                }
                CircuitState::HalfOpen => {
                    if record.half_open_probe_count >= self.settings.half_open_max_calls {
                        let started = record.probe_started_at.unwrap_or_else(Utc::now);
                        let held_for = (Utc::now() - started)
                            .to_std()
                            .unwrap_or(Duration::ZERO);
                        if held_for < self.settings.recovery_timeout {
                            return Ok(AllowDecision::Reject {
                                retry_after: self.settings.recovery_timeout - held_for,
                            });
                        }
                        // No outcome was ever recorded for this batch; the
                        // holder likely crashed mid-call. Reclaim the slots so
                        // the breaker cannot wedge half-open forever.
                        record.half_open_probe_count = 1;
                        record.probe_started_at = Some(Utc::now());
                        if self.save_if(store, &record, version).await? {
                            warn!(service = %self.service, "🟡 BREAKER: abandoned probe slot reclaimed");
                            return Ok(AllowDecision::Admit(CircuitState::HalfOpen));
                        }
                        continue;
                    }
                    record.half_open_probe_count += 1;
                    if record.probe_started_at.is_none() {
                        record.probe_started_at = Some(Utc::now());
                    }
                    if self.save_if(store, &record, version).await? {
                        return Ok(AllowDecision::Admit(CircuitState::HalfOpen));
                    }
                }
            }
        }
        warn!(service = %self.service, "breaker CAS contention exhausted, rejecting call");
        Ok(AllowDecision::Reject {
            retry_after: Duration::ZERO,
        })
    }

    async fn success_on(&self, store: &dyn StateStore) -> StoreResult<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (mut record, version) = self.load(store).await?;
            record.success_count = record.success_count.saturating_add(1);
            let closing = record.state == CircuitState::HalfOpen;
            match record.state {
                CircuitState::HalfOpen => {
                    record.state = CircuitState::Closed;
                    record.failure_count = 0;
                    record.half_open_probe_count = 0;
                    record.probe_started_at = None;
                    record.opened_at = None;
                }
                CircuitState::Closed => {
                    record.failure_count = 0;
                }
                CircuitState::Open => {
                    // Late success from a call admitted before the breaker
                    // opened; no transition.
                }
            }
            if self.save_if(store, &record, version).await? {
                if closing {
                    info!(service = %self.service, "🟢 BREAKER: closed (recovered)");
                } else {
                    debug!(service = %self.service, "🟢 BREAKER: success recorded");
                }
                return Ok(());
            }
        }
        warn!(service = %self.service, "breaker CAS contention exhausted recording success");
        Ok(())
    }

    async fn failure_on(&self, store: &dyn StateStore) -> StoreResult<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = Utc::now();
            let (mut record, version) = self.load(store).await?;
            record.last_failure_at = Some(now);
            let mut opening = false;
            match record.state {
                CircuitState::Closed => {
                    record.failure_count = record.failure_count.saturating_add(1);
                    if record.failure_count >= self.settings.failure_threshold {
                        record.state = CircuitState::Open;
                        record.opened_at = Some(now);
                        record.half_open_probe_count = 0;
                        record.probe_started_at = None;
                        opening = true;
                    }
                }
                CircuitState::HalfOpen => {
                    // Any probe failure reopens immediately with a fresh window.
                    record.state = CircuitState::Open;
                    record.opened_at = Some(now);
                    record.half_open_probe_count = 0;
                    record.probe_started_at = None;
                    opening = true;
                }
                CircuitState::Open => {}
            }
            if self.save_if(store, &record, version).await? {
                if opening {
                    error!(
                        service = %self.service,
                        failure_count = record.failure_count,
                        failure_threshold = self.settings.failure_threshold,
                        "🔴 BREAKER: opened (failing fast)"
                    );
                } else {
                    debug!(service = %self.service, failure_count = record.failure_count, "🔴 BREAKER: failure recorded");
                }
                return Ok(());
            }
        }
        warn!(service = %self.service, "breaker CAS contention exhausted recording failure");
        Ok(())
    }

    async fn expire_on(&self, store: &dyn StateStore) -> StoreResult<bool> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (mut record, version) = self.load(store).await?;
            if record.state != CircuitState::Open {
                return Ok(false);
            }
            let expired_at = Utc::now()
                - chrono::Duration::from_std(self.settings.recovery_timeout)
                    .unwrap_or_default();
            record.opened_at = Some(expired_at);
            if self.save_if(store, &record, version).await? {
                info!(service = %self.service, "⏩ BREAKER: recovery window expired early");
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn force_open_on(&self, store: &dyn StateStore) -> StoreResult<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (mut record, version) = self.load(store).await?;
            record.state = CircuitState::Open;
            record.opened_at = Some(Utc::now());
            record.half_open_probe_count = 0;
            record.probe_started_at = None;
            if self.save_if(store, &record, version).await? {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn reset_on(&self, store: &dyn StateStore) -> StoreResult<()> {
        let fresh = BreakerRecord::new(&self.service);
        let value = serde_json::to_value(&fresh)
            .map_err(|e| StoreError::serialization(e.to_string()))?;
        store.put(&self.key, value).await?;
        Ok(())
    }

    async fn snapshot_on(&self, store: &dyn StateStore) -> StoreResult<BreakerRecord> {
        Ok(self.load(store).await?.0)
    }

    // --- store failover --------------------------------------------------------

    fn note_degraded(&self, message: &str) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            error!(
                service = %self.service,
                policy = ?self.settings.store_failure_policy,
                message = %message,
                "🚨 BREAKER: shared store unavailable, degrading to local mode"
            );
        }
    }

    fn note_recovered(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            info!(service = %self.service, "✅ BREAKER: shared store recovered, local mode abandoned");
        }
    }
}

/// Dispatch for [`CircuitBreaker::run`]: which state-machine operation to
/// execute against the active store.
macro_rules! breaker_ops {
    ($($name:ident => $method:ident : $output:ty),* $(,)?) => {
        impl CircuitBreaker {
            $(
                async fn $name(&self) -> Result<$output, BreakerError> {
                    let attempts = self.settings.store_retry_attempts.max(1);
                    for attempt in 0..attempts {
                        match self.$method(self.store.as_ref()).await {
                            Ok(value) => {
                                self.note_recovered();
                                return Ok(value);
                            }
                            Err(StoreError::Unavailable { message, .. }) => {
                                if attempt + 1 < attempts {
                                    tokio::time::sleep(self.retry_backoff.delay_for(attempt)).await;
                                    continue;
                                }
                                self.note_degraded(&message);
                                return match self.settings.store_failure_policy {
                                    StoreFailurePolicy::FailClosed => {
                                        Err(BreakerError::StoreUnavailable {
                                            service: self.service.clone(),
                                            message,
                                        })
                                    }
                                    StoreFailurePolicy::FailOpen => {
                                        self.$method(&self.local).await.map_err(|e| {
                                            BreakerError::StoreUnavailable {
                                                service: self.service.clone(),
                                                message: e.to_string(),
                                            }
                                        })
                                    }
                                };
                            }
                            Err(other) => {
                                return Err(BreakerError::StoreUnavailable {
                                    service: self.service.clone(),
                                    message: other.to_string(),
                                });
                            }
                        }
                    }
                    unreachable!("retry loop always returns")
                }
            )*
        }
    };
}

breaker_ops! {
    run_allow => allow_on : AllowDecision,
    run_success => success_on : (),
    run_failure => failure_on : (),
    run_expire => expire_on : bool,
    run_force_open => force_open_on : (),
    run_reset => reset_on : (),
    run_snapshot => snapshot_on : BreakerRecord,
}
