//! Prometheus metrics for the engine and the sweeper.
//!
//! Counters are labelled by operation (`reserve`, `reserve_any`, `confirm`,
//! `rollback`) and, for rejections, by reason.
//!
//! # Example
//!
//! ```rust,no_run
//! use leasehold_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use leasehold_core::outcome::RejectReason;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
}

/// Prometheus recorder and scrape endpoint.
///
/// Installs the global `metrics` recorder and serves the text exposition
/// format on `addr`. [`render`](Self::render) produces the same text in-process.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Scrape address (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder, start the scrape listener and describe every
    /// Leasehold metric.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built (e.g., the address is in use).
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., by another test), this logs a
    /// warning and returns `Ok` without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();
        let addr = self.addr;

        if let Err(e) = metrics::set_global_recorder(recorder) {
            tracing::warn!(error = %e, "Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        tokio::spawn(async move {
            // ExporterError does not implement Debug
            if exporter.await.is_err() {
                tracing::warn!(addr = %addr, "Metrics listener stopped");
            }
        });
        register_metrics();
        self.handle = Some(handle);

        tracing::info!(addr = %self.addr, "Serving metrics on http://{}/metrics", self.addr);
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this instance did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Engine
    describe_counter!(
        "leasehold_requests_total",
        "Engine calls, by operation"
    );
    describe_counter!(
        "leasehold_tickets_transitioned_total",
        "Tickets moved by committed engine calls, by operation"
    );
    describe_counter!(
        "leasehold_rejections_total",
        "Tickets rejected by engine calls, by operation and reason"
    );
    describe_counter!(
        "leasehold_commit_conflicts_total",
        "Optimistic commits that lost to a concurrent writer"
    );
    describe_counter!(
        "leasehold_contention_exhausted_total",
        "Engine calls that gave up after too many conflicting commits"
    );
    describe_counter!(
        "leasehold_store_errors_total",
        "Engine calls aborted by a backing store fault"
    );
    describe_counter!(
        "leasehold_inline_reclaims_total",
        "Expired leases reclaimed by Reserve before the sweeper reached them"
    );
    describe_histogram!(
        "leasehold_operation_duration_seconds",
        "Engine call latency, by operation"
    );

    // Sweeper
    describe_counter!(
        "leasehold_leases_reclaimed_total",
        "Expired leases returned to Available by the sweeper"
    );
    describe_counter!(
        "leasehold_sweep_errors_total",
        "Sweep passes that failed for at least one batch"
    );
    describe_histogram!(
        "leasehold_sweep_duration_seconds",
        "Time taken by one sweep pass over every batch"
    );
    describe_gauge!(
        "leasehold_sweep_batches",
        "Batches visited by the last sweep pass"
    );
}

/// Transition engine metrics recorder.
pub struct EngineMetrics;

impl EngineMetrics {
    /// Record a completed engine call.
    pub fn record_call(operation: &'static str, transitioned: usize, duration: Duration) {
        counter!("leasehold_requests_total", "operation" => operation).increment(1);
        counter!("leasehold_tickets_transitioned_total", "operation" => operation)
            .increment(transitioned as u64);
        histogram!("leasehold_operation_duration_seconds", "operation" => operation)
            .record(duration.as_secs_f64());
    }

    /// Record one rejected ticket.
    pub fn record_rejection(operation: &'static str, reason: RejectReason) {
        counter!(
            "leasehold_rejections_total",
            "operation" => operation,
            "reason" => reason.as_str()
        )
        .increment(1);
    }

    /// Record a commit that hit a precondition conflict.
    pub fn record_conflict(operation: &'static str) {
        counter!("leasehold_commit_conflicts_total", "operation" => operation).increment(1);
    }

    /// Record a call that exhausted its commit attempts.
    pub fn record_contention(operation: &'static str) {
        counter!("leasehold_contention_exhausted_total", "operation" => operation).increment(1);
    }

    /// Record a call aborted by a store fault.
    pub fn record_store_error(operation: &'static str) {
        counter!("leasehold_store_errors_total", "operation" => operation).increment(1);
    }

    /// Record expired leases taken over by a reservation.
    pub fn record_inline_reclaims(count: usize) {
        counter!("leasehold_inline_reclaims_total").increment(count as u64);
    }
}

/// Expiry sweeper metrics recorder.
pub struct SweeperMetrics;

impl SweeperMetrics {
    /// Record a finished sweep pass.
    pub fn record_pass(batches: usize, reclaimed: usize, duration: Duration) {
        counter!("leasehold_leases_reclaimed_total").increment(reclaimed as u64);
        gauge!("leasehold_sweep_batches").set(batches as f64);
        histogram!("leasehold_sweep_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a pass that failed for at least one batch.
    pub fn record_error() {
        counter!("leasehold_sweep_errors_total").increment(1);
    }
}
