//! # Delivery Tracker
//!
//! Sweeps expired in-flight deliveries back into circulation. An entry whose
//! visibility timeout lapsed without an ack is either rescheduled with
//! exponential backoff or, once its retry budget is spent, moved to the
//! stream's dead-letter side. Both transitions are conditional at the store,
//! so concurrent sweepers and late acks race safely.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::StreamSettings;
use crate::store::StateStore;

use super::StreamError;

/// Reason recorded on entries quarantined for exhausting their retry budget
pub const REASON_MAX_RETRIES: &str = "max_retries_exceeded";

/// Outcome of one reclaim pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimSummary {
    pub retried: u64,
    pub dead_lettered: u64,
}

impl ReclaimSummary {
    fn merge(&mut self, other: ReclaimSummary) {
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
    }
}

#[derive(Debug)]
pub struct DeliveryTracker {
    store: Arc<dyn StateStore>,
    max_retries: u32,
    backoff: BackoffPolicy,
    reclaim_interval: std::time::Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl DeliveryTracker {
    pub fn new(store: Arc<dyn StateStore>, settings: &StreamSettings) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            store,
            max_retries: settings.max_retries,
            backoff: BackoffPolicy::new(settings.backoff_base(), settings.backoff_max()),
            reclaim_interval: settings.reclaim_interval(),
            shutdown_tx,
        }
    }

    /// Sweep one (stream, group) pair: every expired delivery is either
    /// rescheduled with backoff or dead-lettered.
    pub async fn sweep(
        &self,
        stream: &str,
        group: &str,
        now: DateTime<Utc>,
    ) -> Result<ReclaimSummary, StreamError> {
        let expired = self.store.expired_deliveries(stream, group, now).await?;
        let mut summary = ReclaimSummary::default();

        for entry in expired {
            // retry_count already counts the delivery that just expired.
            if entry.retry_count >= self.max_retries {
                if self
                    .store
                    .stream_dead_letter(stream, entry.id, now, REASON_MAX_RETRIES)
                    .await?
                {
                    summary.dead_lettered += 1;
                    error!(
                        stream = %stream,
                        entry_id = %entry.id,
                        retry_count = entry.retry_count,
                        max_retries = self.max_retries,
                        "💀 DELIVERY: entry dead-lettered"
                    );
                }
                continue;
            }

            let delay = self.backoff.delay_for(entry.retry_count);
            let not_before = now + chrono::Duration::from_std(delay).unwrap_or_default();
            if self.store.stream_retry(stream, entry.id, now, not_before).await? {
                summary.retried += 1;
                warn!(
                    stream = %stream,
                    entry_id = %entry.id,
                    retry_count = entry.retry_count + 1,
                    backoff_ms = delay.as_millis() as u64,
                    "🔁 DELIVERY: expired delivery rescheduled"
                );
            }
        }

        if summary != ReclaimSummary::default() {
            debug!(
                stream = %stream,
                group = %group,
                retried = summary.retried,
                dead_lettered = summary.dead_lettered,
                "reclaim sweep complete"
            );
        }
        Ok(summary)
    }

    /// Sweep every stream of every registered group once.
    pub async fn run_once(&self) -> Result<ReclaimSummary, StreamError> {
        let now = Utc::now();
        let mut summary = ReclaimSummary::default();
        for group in self.store.group_list().await? {
            for stream in &group.streams {
                summary.merge(self.sweep(stream, &group.name, now).await?);
            }
        }
        Ok(summary)
    }

    /// Spawn the periodic reclaim loop. Runs until [`stop`](Self::stop).
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let tracker = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(
            interval_secs = self.reclaim_interval.as_secs(),
            "🔁 DELIVERY: reclaim loop starting"
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tracker.reclaim_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = tracker.run_once().await {
                            warn!(error = %e, "reclaim pass failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("🔁 DELIVERY: reclaim loop stopping");
                        break;
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
