//! Backing-store contract.
//!
//! This module defines the narrow interface the engine needs from a key-value
//! store: snapshot reads of ticket status and leases, a score-ordered lease
//! index, and one atomic primitive - [`TicketStore::commit`] - that applies a
//! [`WriteSet`] if and only if all of its preconditions still hold.
//!
//! # Design
//!
//! The engine never holds a lock across round trips. Each unit of work is:
//!
//! 1. **Read** a snapshot of the tickets involved
//! 2. **Plan** a write set: preconditions pinning the state that was read, plus
//!    the mutations derived from it
//! 3. **Commit or abort**: the store checks every precondition and applies every
//!    mutation indivisibly, or applies nothing and reports [`CommitOutcome::Conflict`]
//!
//! Any store offering server-side scripting (Redis `EVAL`) or optimistic
//! multi-key transactions can implement this; the rest of the engine does not
//! know which mechanism is used.
//!
//! # Implementations
//!
//! - `RedisTicketStore` (in `leasehold-redis` crate): Production implementation
//! - `InMemoryTicketStore` (in `leasehold-testing` crate): Fast, deterministic testing
//!
//! # Example
//!
//! ```no_run
//! use leasehold_core::partition::Partitioner;
//! use leasehold_core::store::{CommitOutcome, Mutation, Precondition, TicketStore, WriteSet};
//! use leasehold_core::types::{BatchId, TicketId, TicketStatus};
//! use leasehold_core::StoreError;
//!
//! async fn sell_directly<S: TicketStore>(store: &S) -> Result<bool, StoreError> {
//!     let partition = Partitioner::default().partition_key(&BatchId::new("90"));
//!     let ticket = TicketId::new("7");
//!
//!     let mut writes = WriteSet::default();
//!     writes.require(Precondition::Status { ticket_id: ticket.clone(), expected: TicketStatus::Available });
//!     writes.push(Mutation::Move { ticket_id: ticket, from: TicketStatus::Available, to: TicketStatus::Sold });
//!
//!     Ok(store.commit(&partition, writes).await? == CommitOutcome::Committed)
//! }
//! ```

use crate::error::StoreError;
use crate::outcome::StatusCounts;
use crate::partition::PartitionKey;
use crate::types::{BatchId, Lease, LeaseId, Ticket, TicketId, TicketStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Snapshot of one ticket as seen by a [`TicketStore::read`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TicketView {
    /// Ticket that was read
    pub ticket_id: TicketId,
    /// Status set membership; `None` if the ticket is not in the catalog
    pub status: Option<TicketStatus>,
    /// Lease record, if any
    pub lease: Option<Lease>,
}

impl TicketView {
    /// View of a ticket absent from the catalog.
    #[must_use]
    pub const fn unknown(ticket_id: TicketId) -> Self {
        Self {
            ticket_id,
            status: None,
            lease: None,
        }
    }

    /// Id of the lease observed in this snapshot, if any.
    #[must_use]
    pub fn lease_id(&self) -> Option<LeaseId> {
        self.lease.as_ref().map(|l| l.lease_id)
    }
}

/// One lease index entry: a ticket and its expiry score (unix milliseconds).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Indexed ticket
    pub ticket_id: TicketId,
    /// Expiry, in unix milliseconds
    pub score: i64,
}

/// A condition that must hold at commit time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Precondition {
    /// The ticket is a member of the `expected` status set.
    Status {
        /// Ticket to check
        ticket_id: TicketId,
        /// Required status
        expected: TicketStatus,
    },
    /// The ticket's lease record has exactly this id (`None` = no lease record).
    Lease {
        /// Ticket to check
        ticket_id: TicketId,
        /// Required lease id
        expected: Option<LeaseId>,
    },
}

/// A single change applied by a committed [`WriteSet`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    /// Move the ticket from one status set to another.
    Move {
        /// Ticket to move
        ticket_id: TicketId,
        /// Current set
        from: TicketStatus,
        /// Target set
        to: TicketStatus,
    },
    /// Create or replace the ticket's lease record.
    PutLease(Lease),
    /// Delete the ticket's lease record.
    DeleteLease(TicketId),
    /// Insert (or re-score) the ticket's lease index entry.
    IndexInsert {
        /// Indexed ticket
        ticket_id: TicketId,
        /// Expiry, in unix milliseconds
        score: i64,
    },
    /// Remove the ticket's lease index entry.
    IndexRemove(TicketId),
}

/// A proposed unit of work: preconditions plus mutations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteSet {
    /// Conditions pinning the snapshot the plan was derived from
    pub preconditions: Vec<Precondition>,
    /// Changes to apply if every precondition holds
    pub mutations: Vec<Mutation>,
}

impl WriteSet {
    /// Add a precondition.
    pub fn require(&mut self, precondition: Precondition) {
        self.preconditions.push(precondition);
    }

    /// Add a mutation.
    pub fn push(&mut self, mutation: Mutation) {
        self.mutations.push(mutation);
    }

    /// Pin both status and lease id of a snapshot view.
    pub fn pin(&mut self, view: &TicketView, status: TicketStatus) {
        self.require(Precondition::Status {
            ticket_id: view.ticket_id.clone(),
            expected: status,
        });
        self.require(Precondition::Lease {
            ticket_id: view.ticket_id.clone(),
            expected: view.lease_id(),
        });
    }

    /// Returns `true` if there is nothing to apply.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

/// Result of [`TicketStore::commit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Every precondition held; every mutation was applied.
    Committed,
    /// At least one precondition failed; nothing was applied.
    Conflict,
}

/// Backing-store abstraction for ticket leasing.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the engine and the sweeper share one
/// store handle across tasks.
///
/// # Atomicity
///
/// Only [`commit`](Self::commit) mutates status sets, leases or the lease index.
/// Everything one commit touches is addressed through a single [`PartitionKey`],
/// so it never spans more than one shard.
pub trait TicketStore: Send + Sync {
    /// Write tickets into the catalog and the Available set.
    ///
    /// Tickets whose id is already in the catalog are skipped (the catalog is
    /// write-once). Registers the batch for sweeping.
    ///
    /// # Returns
    ///
    /// Number of newly provisioned tickets.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable or a ticket cannot be encoded.
    fn provision(
        &self,
        partition: &PartitionKey,
        tickets: &[Ticket],
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;

    /// Read one consistent snapshot of status and lease for each ticket.
    ///
    /// Returns one view per requested id, in request order.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable or a lease record is malformed.
    fn read(
        &self,
        partition: &PartitionKey,
        ticket_ids: &[TicketId],
    ) -> impl Future<Output = Result<Vec<TicketView>, StoreError>> + Send;

    /// Lease index entries with `score <= now`, oldest first, skipping the
    /// first `offset` and returning at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn expired(
        &self,
        partition: &PartitionKey,
        now: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<IndexEntry>, StoreError>> + Send;

    /// Up to `count` distinct members of the Available set, in no particular order.
    ///
    /// Fewer than `count` ids means the set holds fewer members.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn sample_available(
        &self,
        partition: &PartitionKey,
        count: usize,
    ) -> impl Future<Output = Result<Vec<TicketId>, StoreError>> + Send;

    /// Atomically apply `writes` if every precondition holds.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable. A failed precondition is
    /// not an error: it yields [`CommitOutcome::Conflict`].
    fn commit(
        &self,
        partition: &PartitionKey,
        writes: WriteSet,
    ) -> impl Future<Output = Result<CommitOutcome, StoreError>> + Send;

    /// Catalog record of a ticket.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable or the record is malformed.
    fn ticket(
        &self,
        partition: &PartitionKey,
        ticket_id: &TicketId,
    ) -> impl Future<Output = Result<Option<Ticket>, StoreError>> + Send;

    /// Size of each status set.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn counts(
        &self,
        partition: &PartitionKey,
    ) -> impl Future<Output = Result<StatusCounts, StoreError>> + Send;

    /// Every provisioned batch.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn batches(&self) -> impl Future<Output = Result<Vec<BatchId>, StoreError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HolderId;

    #[test]
    fn pin_records_status_and_lease() {
        let lease = Lease {
            ticket_id: TicketId::new("1"),
            lease_id: LeaseId::new(),
            holder_id: HolderId::new("h"),
            expires_at: Utc::now(),
        };
        let view = TicketView {
            ticket_id: TicketId::new("1"),
            status: Some(TicketStatus::Reserved),
            lease: Some(lease.clone()),
        };

        let mut writes = WriteSet::default();
        writes.pin(&view, TicketStatus::Reserved);

        assert!(writes.is_empty());
        assert_eq!(
            writes.preconditions,
            vec![
                Precondition::Status { ticket_id: TicketId::new("1"), expected: TicketStatus::Reserved },
                Precondition::Lease { ticket_id: TicketId::new("1"), expected: Some(lease.lease_id) },
            ]
        );
    }
}
