//! End-to-end scenarios wiring the subsystems together over one shared store:
//! breaker trip/recovery, the full enqueue/claim/ack delivery cycle, crash
//! redelivery climbing into the dead-letter queue, and degraded responses
//! while a circuit is open.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use relay_core::breaker::{BreakerError, CircuitBreakerRegistry, CircuitState};
use relay_core::config::{BreakerOverride, BreakerSettings, HealthSettings, StreamSettings};
use relay_core::degradation::{DegradationManager, FallbackStrategy};
use relay_core::health::{HealthChecker, HealthMonitor, RecoveryManager};
use relay_core::status::StatusCollector;
use relay_core::store::MemoryStateStore;
use relay_core::stream::{DeadLetterQueue, StreamManager};

fn breaker_settings(threshold: u32) -> BreakerSettings {
    let mut settings = BreakerSettings::default();
    settings.services.insert(
        "payments".to_string(),
        BreakerOverride {
            failure_threshold: Some(threshold),
            recovery_timeout_seconds: None,
            half_open_max_calls: Some(1),
        },
    );
    settings.failure_threshold = threshold;
    settings.recovery_timeout_seconds = 1;
    settings
}

#[tokio::test]
async fn breaker_trips_recovers_and_closes_again() {
    let store = Arc::new(MemoryStateStore::new());
    let registry = Arc::new(CircuitBreakerRegistry::new(store, breaker_settings(3)));
    let breaker = registry.breaker("payments");

    // Three consecutive failures trip the circuit.
    for _ in 0..3 {
        let result = breaker
            .call(|| async { Err::<Value, _>("502 bad gateway".to_string()) })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(breaker.state().await.unwrap(), CircuitState::Open);

    // While open, calls are rejected without running and carry a retry hint.
    match breaker.allow().await {
        Err(BreakerError::CircuitOpen { retry_after, .. }) => {
            assert!(retry_after <= Duration::from_secs(1));
        }
        other => panic!("expected open rejection, got {other:?}"),
    }

    // After the recovery window a single probe is admitted and its success
    // closes the circuit for everyone.
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let recovered = breaker
        .call(|| async { Ok::<_, String>(json!({"status": "ok"})) })
        .await
        .unwrap();
    assert_eq!(recovered["status"], "ok");
    assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
}

#[tokio::test]
async fn confirmed_health_reopens_the_circuit_early() {
    let store = Arc::new(MemoryStateStore::new());
    let registry = Arc::new(CircuitBreakerRegistry::new(
        store.clone(),
        BreakerSettings {
            failure_threshold: 1,
            // Long window: only the recovery manager can shorten it.
            recovery_timeout_seconds: 3_600,
            ..BreakerSettings::default()
        },
    ));
    let breaker = registry.breaker("search");
    breaker.record_failure().await.unwrap();
    assert!(breaker.allow().await.is_err());

    let health_settings = HealthSettings {
        recovery_confirmations: 2,
        early_recovery: true,
        ..HealthSettings::default()
    };
    let recovery = Arc::new(RecoveryManager::new(registry.clone(), &health_settings));
    let monitor = Arc::new(
        HealthMonitor::new(store, health_settings.clone()).with_recovery(recovery),
    );
    monitor.register(HealthChecker::from_fn(
        "search",
        &health_settings,
        || async { Ok(()) },
    ));

    // One healthy probe is not enough; two confirmations expire the window.
    monitor.check_service("search").await.unwrap();
    assert!(breaker.allow().await.is_err());
    monitor.check_service("search").await.unwrap();

    let permit = breaker.allow().await.unwrap();
    assert_eq!(permit.state, CircuitState::HalfOpen);
}

#[tokio::test]
async fn degraded_response_serves_while_circuit_open() {
    let store = Arc::new(MemoryStateStore::new());
    let registry = CircuitBreakerRegistry::new(
        store,
        BreakerSettings {
            failure_threshold: 1,
            recovery_timeout_seconds: 3_600,
            ..BreakerSettings::default()
        },
    );
    let breaker = registry.breaker("recommendations");

    let degradation = DegradationManager::new();
    degradation.register(
        "recommendations",
        FallbackStrategy::StaticResponse(json!({"items": [], "personalized": false})),
    );

    // The failing call itself already gets the fallback.
    let first = degradation
        .guarded_call(&breaker, Value::Null, || async {
            Err::<Value, _>("timeout".to_string())
        })
        .await
        .unwrap();
    let fallback = first.unwrap_err();
    assert!(fallback.degraded);

    // Subsequent calls never reach the downstream; the fallback answers.
    let second = degradation
        .guarded_call(&breaker, Value::Null, || async {
            panic!("must not run while the circuit is open")
        })
        .await
        .unwrap();
    assert_eq!(second.unwrap_err().body["personalized"], json!(false));
}

#[tokio::test]
async fn delivery_cycle_with_ack_and_competing_consumers() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStateStore::new());
    let streams = StreamManager::new(store, StreamSettings::default());
    streams
        .create_group("billing", &["invoices".to_string()], true)
        .await?;

    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(streams.enqueue("invoices", json!({"invoice": n})).await?);
    }
    for pair in ids.windows(2) {
        assert!(pair[0] < pair[1], "ids must strictly increase");
    }

    // First consumer takes three; they are invisible to the second consumer.
    let batch = streams.claim("invoices", "billing", "worker-1", 3).await?;
    assert_eq!(batch.len(), 3);
    for entry in &batch {
        assert!(streams.ack("invoices", "billing", entry.id).await?);
    }

    let rest = streams.claim("invoices", "billing", "worker-2", 10).await?;
    assert_eq!(rest.len(), 2);
    assert_eq!(rest[0].payload, json!({"invoice": 3}));
    assert_eq!(streams.pending_count("invoices", "billing").await?, 0);
    Ok(())
}

#[tokio::test]
async fn unacked_delivery_retries_then_dead_letters_and_requeues() {
    let store = Arc::new(MemoryStateStore::new());
    let settings = StreamSettings {
        visibility_timeout_seconds: 1,
        max_retries: 1,
        backoff_base_ms: 100,
        backoff_max_ms: 200,
        ..StreamSettings::default()
    };
    let streams = StreamManager::new(store.clone(), settings);
    streams
        .create_group("workers", &["jobs".to_string()], true)
        .await
        .unwrap();
    let poison = streams.enqueue("jobs", json!({"poison": true})).await.unwrap();

    // First delivery "crashes" (never acked) and expires.
    let first = streams.claim("jobs", "workers", "crashy", 1).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].retry_count, 0);
    tokio::time::sleep(Duration::from_millis(1_100)).await;

    // The lazy reclaim inside claim reschedules the entry behind its backoff
    // gate, so this poll comes back empty.
    assert!(streams.claim("jobs", "workers", "crashy", 1).await.unwrap().is_empty());

    // Once the backoff elapses the entry is redelivered with its retry count.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let second = streams.claim("jobs", "workers", "crashy", 1).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id, poison);
    assert_eq!(second[0].retry_count, 1);
    tokio::time::sleep(Duration::from_millis(1_100)).await;

    // Retry budget (1) spent: the next sweep quarantines instead of redelivering.
    let third = streams.claim("jobs", "workers", "crashy", 1).await.unwrap();
    assert!(third.is_empty());

    let dlq = DeadLetterQueue::new(store);
    let dead = dlq.entries("jobs").await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].dead_reason.as_deref(), Some("max_retries_exceeded"));
    assert_eq!(dead[0].payload, json!({"poison": true}));

    // Operator requeues: the payload returns as a fresh entry.
    let requeued = dlq.requeue("jobs", dead[0].id).await.unwrap().unwrap();
    let fresh = streams.claim("jobs", "workers", "recovered", 1).await.unwrap();
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].id, requeued);
    assert_eq!(fresh[0].retry_count, 0);
}

#[tokio::test]
async fn status_report_reflects_live_state() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStateStore::new());

    let registry = Arc::new(CircuitBreakerRegistry::new(
        store.clone(),
        BreakerSettings::default(),
    ));
    registry.force_open("payments").await?;
    registry.breaker("search");

    let streams = Arc::new(StreamManager::new(store, StreamSettings::default()));
    streams
        .create_group("workers", &["jobs".to_string()], true)
        .await?;
    streams.enqueue("jobs", json!(1)).await?;
    streams.enqueue("jobs", json!(2)).await?;

    let collector = StatusCollector::new()
        .with_breakers(registry.clone())
        .with_streams(streams);
    let report = collector.report().await?;

    assert_eq!(report.breakers.len(), 2);
    assert!(!report.all_clear());
    assert_eq!(report.groups[0].name, "workers");
    assert_eq!(report.groups[0].pending, 2);

    registry.reset("payments").await?;
    assert!(collector.report().await?.all_clear());
    Ok(())
}
