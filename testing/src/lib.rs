//! # Leasehold Testing
//!
//! Testing utilities for Leasehold.
//!
//! This crate provides:
//! - [`InMemoryTicketStore`]: a [`TicketStore`](leasehold_core::TicketStore) with the
//!   Redis layout, fault injection and an invariant checker
//! - Clocks: [`FixedClock`] and the steerable [`ManualClock`] for driving lease expiry
//! - Helpers for building catalogs
//! - proptest strategies for random operation sequences
//!
//! ## Example
//!
//! ```
//! use chrono::TimeDelta;
//! use leasehold_core::environment::Clock;
//! use leasehold_testing::{test_clock, ManualClock};
//!
//! let clock = ManualClock::new(test_clock().now());
//! let start = clock.now();
//! clock.advance(TimeDelta::seconds(31));
//! assert_eq!(clock.now() - start, TimeDelta::seconds(31));
//! ```

use chrono::{DateTime, Utc};
use leasehold_core::environment::Clock;

mod memory_store;

pub use memory_store::{InMemoryTicketStore, InvariantViolation};

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use chrono::TimeDelta;
    use std::sync::{Arc, Mutex};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use leasehold_testing::mocks::FixedClock;
    /// use leasehold_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can hand one clone to the engine
    /// and keep another to let leases expire without sleeping.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock stopped at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            if let Ok(mut current) = self.time.lock() {
                *current = time;
            }
        }

        /// Move the clock forward by `delta`.
        pub fn advance(&self, delta: TimeDelta) {
            if let Ok(mut current) = self.time.lock() {
                *current += delta;
            }
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
                .lock()
                .map_or_else(|poisoned| *poisoned.into_inner(), |time| *time)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default())
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use leasehold_core::types::{BatchId, Ticket, TicketId};

    /// `count` tickets of `batch_id` with ids `"1"..="count"`.
    #[must_use]
    pub fn tickets(batch_id: &BatchId, count: usize) -> Vec<Ticket> {
        (1..=count)
            .map(|n| Ticket::new(n.to_string(), batch_id.clone(), format!("Seat {n}")))
            .collect()
    }

    /// Ticket ids from string-like values.
    #[must_use]
    pub fn ids<I, T>(ids: I) -> Vec<TicketId>
    where
        I: IntoIterator<Item = T>,
        T: Into<TicketId>,
    {
        ids.into_iter().map(Into::into).collect()
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// One step of a random lease workload.
    ///
    /// Tickets and holders are indices into a fixed universe chosen by the test.
    #[derive(Debug, Clone)]
    pub enum LeaseOp {
        /// Reserve specific tickets
        Reserve {
            /// Ticket indices
            tickets: Vec<usize>,
            /// Holder index
            holder: usize,
            /// Lease duration
            lease_seconds: u64,
        },
        /// Reserve any `count` tickets
        ReserveAny {
            /// Tickets wanted
            count: usize,
            /// Holder index
            holder: usize,
        },
        /// Confirm specific tickets
        Confirm {
            /// Ticket indices
            tickets: Vec<usize>,
            /// Holder index
            holder: usize,
        },
        /// Release specific tickets
        Rollback {
            /// Ticket indices
            tickets: Vec<usize>,
            /// Holder index
            holder: usize,
        },
        /// Let time pass
        Advance {
            /// Seconds to advance
            seconds: u64,
        },
        /// Run one sweep pass
        Sweep,
    }

    /// Strategy for a single [`LeaseOp`] over `tickets` tickets and `holders` holders.
    pub fn lease_op(tickets: usize, holders: usize) -> impl Strategy<Value = LeaseOp> {
        let picks = || prop::collection::vec(0..tickets, 1..=tickets.min(4));
        prop_oneof![
            4 => (picks(), 0..holders, 1u64..=10).prop_map(|(tickets, holder, lease_seconds)| {
                LeaseOp::Reserve { tickets, holder, lease_seconds }
            }),
            1 => (1..=tickets.min(3), 0..holders)
                .prop_map(|(count, holder)| LeaseOp::ReserveAny { count, holder }),
            3 => (picks(), 0..holders)
                .prop_map(|(tickets, holder)| LeaseOp::Confirm { tickets, holder }),
            2 => (picks(), 0..holders)
                .prop_map(|(tickets, holder)| LeaseOp::Rollback { tickets, holder }),
            2 => (1u64..=12).prop_map(|seconds| LeaseOp::Advance { seconds }),
            1 => Just(LeaseOp::Sweep),
        ]
    }

    /// Strategy for a workload of up to `max_len` operations.
    pub fn lease_ops(
        tickets: usize,
        holders: usize,
        max_len: usize,
    ) -> impl Strategy<Value = Vec<LeaseOp>> {
        prop::collection::vec(lease_op(tickets, holders), 1..=max_len)
    }
}

// Re-export commonly used items
pub use helpers::{ids, tickets};
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use properties::{LeaseOp, lease_op, lease_ops};
