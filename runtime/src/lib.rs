//! # Leasehold Runtime
//!
//! The moving parts of Leasehold on top of the [`leasehold_core`] contract.
//!
//! ## Core Components
//!
//! - **Transition Engine** ([`TransitionEngine`]): Reserve, Confirm, Rollback,
//!   `ReserveAny`, provisioning and counts, each as one atomic commit per call
//! - **Lease Index** ([`LeaseIndex`]): finds and reclaims expired leases without
//!   scanning the catalog
//! - **Expiry Sweeper** ([`ExpirySweeper`]): background task that drives the
//!   lease index on a fixed interval
//! - **Metrics** ([`metrics`]): Prometheus counters and histograms for both
//!
//! ## Example
//!
//! ```no_run
//! use leasehold_core::environment::SystemClock;
//! use leasehold_core::types::{BatchId, HolderId, Ticket};
//! use leasehold_core::{ReserveAnyOutcome, TicketStore};
//! use leasehold_runtime::{EngineConfig, TransitionEngine};
//! use std::sync::Arc;
//!
//! # async fn example<S: TicketStore + 'static>(store: Arc<S>) -> Result<(), leasehold_core::EngineError> {
//! let engine = TransitionEngine::new(store, Arc::new(SystemClock), EngineConfig::from_env());
//!
//! let batch = BatchId::new("90");
//! let tickets: Vec<Ticket> = (1..=100)
//!     .map(|n| Ticket::new(n.to_string(), batch.clone(), format!("Seat {n}")))
//!     .collect();
//! engine.provision(&batch, &tickets).await?;
//!
//! // Reclaim lapsed leases in the background
//! let (sweeper, shutdown) = engine.sweeper();
//! let sweeper = sweeper.spawn();
//!
//! let holder = HolderId::new("session-1");
//! if let ReserveAnyOutcome::Reserved(held) = engine.reserve_any(&batch, 2, &holder, 30).await? {
//!     let ids: Vec<_> = held.into_iter().map(|t| t.ticket_id).collect();
//!     engine.confirm(&batch, &ids, &holder).await?;
//! }
//!
//! shutdown.send(true).ok();
//! sweeper.await.ok();
//! # Ok(())
//! # }
//! ```

/// Engine and sweeper configuration
pub mod config;

/// Reserve / Confirm / Rollback over a backing store
pub mod engine;

/// Expiry-ordered lease index and reclamation
pub mod lease_index;

/// Prometheus metrics for observability
pub mod metrics;

/// Background expiry sweeper
pub mod sweeper;

mod plan;

pub use config::EngineConfig;
pub use engine::TransitionEngine;
pub use lease_index::{ExpiredPage, LeaseIndex};
pub use sweeper::{ExpirySweeper, SweepReport};
