//! Background reclamation of expired leases.
//!
//! The [`ExpirySweeper`] wakes up every `sweep_interval`, lists every
//! provisioned batch and asks the [`LeaseIndex`] to reclaim what has expired,
//! page by page. A failing batch is logged and skipped; the next tick tries
//! again. Reclamation never depends on the sweeper for correctness: Reserve
//! takes over expired leases inline, and Confirm refuses them. The sweeper only
//! keeps the Available set from going stale.
//!
//! # Example
//!
//! ```no_run
//! use leasehold_core::TicketStore;
//! use leasehold_runtime::TransitionEngine;
//!
//! # async fn example<S: TicketStore + 'static>(engine: TransitionEngine<S>) {
//! let (sweeper, shutdown) = engine.sweeper();
//! let handle = sweeper.spawn();
//!
//! // ... later
//! shutdown.send(true).ok();
//! handle.await.ok();
//! # }
//! ```

use crate::config::EngineConfig;
use crate::lease_index::LeaseIndex;
use crate::metrics::SweeperMetrics;
use chrono::{DateTime, Utc};
use leasehold_core::environment::Clock;
use leasehold_core::store::TicketStore;
use leasehold_core::types::BatchId;
use leasehold_core::StoreError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Result of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Batches visited
    pub batches: usize,
    /// Leases returned to Available
    pub reclaimed: usize,
    /// Batches whose reclamation failed and will be retried next tick
    pub failed_batches: Vec<BatchId>,
}

/// Periodically returns expired leases to the Available set.
pub struct ExpirySweeper<S> {
    store: Arc<S>,
    index: LeaseIndex<S>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    batch_limit: usize,
    shutdown: watch::Receiver<bool>,
}

impl<S: TicketStore> ExpirySweeper<S> {
    /// Create a sweeper.
    ///
    /// Returns the sweeper and a shutdown sender. Send `true` to stop it;
    /// dropping the sender stops it too.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = Self {
            index: LeaseIndex::new(Arc::clone(&store), config.partitioner()),
            store,
            clock,
            interval: config.sweep_interval().max(Duration::from_millis(1)),
            batch_limit: config.sweep_batch_limit.max(1),
            shutdown: shutdown_rx,
        };
        (sweeper, shutdown_tx)
    }

    /// Reclaim everything that expired at or before `now`, across every batch.
    ///
    /// # Errors
    ///
    /// Returns error only if the batch registry cannot be listed. Failures of
    /// individual batches are reported in [`SweepReport::failed_batches`].
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let start = Instant::now();
        let batches = self.store.batches().await?;

        let mut report = SweepReport {
            batches: batches.len(),
            ..SweepReport::default()
        };

        for batch_id in batches {
            match self.sweep_batch(&batch_id, now).await {
                Ok(reclaimed) => report.reclaimed += reclaimed,
                Err(e) => {
                    tracing::warn!(batch = %batch_id, error = %e, "Sweep of batch failed");
                    report.failed_batches.push(batch_id);
                }
            }
        }

        if !report.failed_batches.is_empty() {
            SweeperMetrics::record_error();
        }
        SweeperMetrics::record_pass(report.batches, report.reclaimed, start.elapsed());
        if report.reclaimed > 0 {
            tracing::info!(
                batches = report.batches,
                reclaimed = report.reclaimed,
                "Reclaimed expired leases"
            );
        }
        Ok(report)
    }

    /// Pages through one batch until a page comes back short.
    ///
    /// Entries a page leaves in the index are skipped by the next page.
    async fn sweep_batch(&self, batch_id: &BatchId, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut total = 0;
        let mut offset = 0;
        loop {
            let page = self
                .index
                .pop_expired_page(batch_id, now, offset, self.batch_limit)
                .await?;
            total += page.reclaimed.len();
            if page.scanned < self.batch_limit {
                return Ok(total);
            }
            offset += page.retained;
        }
    }

    /// Sweep on every tick until shutdown is signalled.
    pub async fn run(mut self) {
        tracing::info!(
            interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
            batch_limit = self.batch_limit,
            "Starting expiry sweeper"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*self.shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once(self.clock.now()).await {
                        SweeperMetrics::record_error();
                        tracing::warn!(error = %e, "Sweep failed, retrying next tick");
                    }
                }

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        tracing::info!("Shutdown signal received");
                        break;
                    }
                }
            }
        }

        tracing::info!("Expiry sweeper stopped");
    }
}

impl<S: TicketStore + 'static> ExpirySweeper<S> {
    /// Run the sweeper on a new tokio task.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
