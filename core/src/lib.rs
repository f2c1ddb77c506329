//! # Leasehold Core
//!
//! Core types and traits for Leasehold, a lease-based ticket reservation engine.
//!
//! Many concurrent clients reserve, confirm or release discrete tickets against a
//! shared pool. A reservation is a *lease*: if the holder never confirms it, the
//! lease expires and the ticket goes back to the pool.
//!
//! ## Core Concepts
//!
//! - **Ticket Catalog**: Immutable per-ticket metadata written once at provisioning
//! - **Status Partition**: Three mutually exclusive sets per batch (Available, Reserved, Sold)
//! - **Reservation Lease**: Holder + expiry for every Reserved ticket
//! - **Lease Index**: Expiry-ordered index used to find lapsed leases without scanning
//! - **Partition Key**: Colocates every record of a batch on one storage shard
//!
//! ## Architecture Principles
//!
//! - The backing store is an explicit handle ([`store::TicketStore`]), never global state
//! - Every mutation is a [`store::WriteSet`]: preconditions plus mutations, committed or
//!   aborted as one unit
//! - Per-ticket business outcomes are values ([`outcome`]), not errors
//! - Time is injected through [`environment::Clock`]
//!
//! ## Example
//!
//! ```
//! use leasehold_core::partition::Partitioner;
//! use leasehold_core::types::BatchId;
//!
//! let partitioner = Partitioner::default();
//! let key = partitioner.partition_key(&BatchId::new("90"));
//!
//! // Every key of the batch shares one hash tag, hence one cluster slot
//! assert_eq!(key.slot(), partitioner.partition_key(&BatchId::new("90")).slot());
//! assert_eq!(key.key("available"), "leasehold:{90}:available");
//! ```

pub mod error;
pub mod outcome;
pub mod partition;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use error::{EngineError, StoreError};
pub use outcome::{
    ConfirmOutcome, RejectReason, Rejection, ReserveAnyOutcome, ReserveOutcome,
    ReservedTicket, RollbackOutcome, StatusCounts,
};
pub use partition::{PartitionKey, PartitionScheme, Partitioner};
pub use store::{CommitOutcome, IndexEntry, Mutation, Precondition, TicketStore, TicketView, WriteSet};
pub use types::{BatchId, HolderId, Lease, LeaseId, Ticket, TicketId, TicketStatus};

/// Environment module - Dependency injection traits
///
/// All sources of nondeterminism the engine depends on are abstracted behind
/// traits and injected, so tests can drive lease expiry without sleeping.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use leasehold_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
        fn now(&self) -> DateTime<Utc> {
            (**self).now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{Clock, SystemClock};
    use std::sync::Arc;

    #[test]
    fn arc_clock_delegates() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let t1 = clock.now();
        let t2 = clock.now();
        assert!(t2 >= t1);
    }
}
