//! In-memory [`TicketStore`] for fast, deterministic tests.
//!
//! Mirrors the Redis layout one-to-one: per partition, three status sets, a
//! ticket catalog, a lease map and a score-ordered lease index, plus a global
//! batch registry. A single mutex makes every call trivially atomic, so the
//! engine's optimistic protocol is exercised exactly as against Redis.
//!
//! Faults can be injected with [`InMemoryTicketStore::set_unavailable`].

use chrono::{DateTime, Utc};
use leasehold_core::outcome::StatusCounts;
use leasehold_core::partition::PartitionKey;
use leasehold_core::store::{
    CommitOutcome, IndexEntry, Mutation, Precondition, TicketStore, TicketView, WriteSet,
};
use leasehold_core::types::{BatchId, Lease, Ticket, TicketId, TicketStatus};
use leasehold_core::StoreError;
use rand::seq::IteratorRandom;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Records of one partition.
#[derive(Debug, Default, Clone)]
struct Partition {
    catalog: HashMap<TicketId, Ticket>,
    available: BTreeSet<TicketId>,
    reserved: BTreeSet<TicketId>,
    sold: BTreeSet<TicketId>,
    leases: HashMap<TicketId, Lease>,
    index: BTreeSet<(i64, TicketId)>,
    scores: HashMap<TicketId, i64>,
}

impl Partition {
    const fn set(&self, status: TicketStatus) -> &BTreeSet<TicketId> {
        match status {
            TicketStatus::Available => &self.available,
            TicketStatus::Reserved => &self.reserved,
            TicketStatus::Sold => &self.sold,
        }
    }

    fn set_mut(&mut self, status: TicketStatus) -> &mut BTreeSet<TicketId> {
        match status {
            TicketStatus::Available => &mut self.available,
            TicketStatus::Reserved => &mut self.reserved,
            TicketStatus::Sold => &mut self.sold,
        }
    }

    fn status_of(&self, ticket_id: &TicketId) -> Option<TicketStatus> {
        TicketStatus::ALL
            .into_iter()
            .find(|status| self.set(*status).contains(ticket_id))
    }

    fn holds(&self, precondition: &Precondition) -> bool {
        match precondition {
            Precondition::Status { ticket_id, expected } => self.set(*expected).contains(ticket_id),
            Precondition::Lease { ticket_id, expected } => {
                self.leases.get(ticket_id).map(|l| l.lease_id) == *expected
            }
        }
    }

    fn apply(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::Move { ticket_id, from, to } => {
                if self.set_mut(from).remove(&ticket_id) {
                    self.set_mut(to).insert(ticket_id);
                }
            }
            Mutation::PutLease(lease) => {
                self.leases.insert(lease.ticket_id.clone(), lease);
            }
            Mutation::DeleteLease(ticket_id) => {
                self.leases.remove(&ticket_id);
            }
            Mutation::IndexInsert { ticket_id, score } => {
                if let Some(old) = self.scores.insert(ticket_id.clone(), score) {
                    self.index.remove(&(old, ticket_id.clone()));
                }
                self.index.insert((score, ticket_id));
            }
            Mutation::IndexRemove(ticket_id) => {
                if let Some(old) = self.scores.remove(&ticket_id) {
                    self.index.remove(&(old, ticket_id));
                }
            }
        }
    }

    fn check(&self) -> Result<(), InvariantViolation> {
        for ticket_id in self.catalog.keys() {
            let sets = TicketStatus::ALL
                .into_iter()
                .filter(|status| self.set(*status).contains(ticket_id))
                .count();
            if sets != 1 {
                return Err(InvariantViolation::Membership {
                    ticket_id: ticket_id.clone(),
                    sets,
                });
            }
        }

        for status in TicketStatus::ALL {
            if let Some(orphan) = self.set(status).iter().find(|id| !self.catalog.contains_key(*id)) {
                return Err(InvariantViolation::NotInCatalog {
                    ticket_id: orphan.clone(),
                    status,
                });
            }
        }

        for ticket_id in &self.reserved {
            if !self.leases.contains_key(ticket_id) {
                return Err(InvariantViolation::MissingLease(ticket_id.clone()));
            }
        }

        for (ticket_id, lease) in &self.leases {
            if !self.reserved.contains(ticket_id) {
                return Err(InvariantViolation::LeaseWithoutReservation(ticket_id.clone()));
            }
            if self.scores.get(ticket_id) != Some(&lease.expiry_score()) {
                return Err(InvariantViolation::IndexMismatch(ticket_id.clone()));
            }
        }

        if let Some(stray) = self.scores.keys().find(|id| !self.leases.contains_key(*id)) {
            return Err(InvariantViolation::IndexMismatch(stray.clone()));
        }
        if self.index.len() != self.scores.len() {
            return Err(InvariantViolation::IndexCorrupt);
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
struct State {
    partitions: HashMap<PartitionKey, Partition>,
    registry: BTreeSet<BatchId>,
}

/// A broken storage invariant, as found by [`InMemoryTicketStore::check_invariants`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// A catalog ticket is in zero or several status sets.
    #[error("ticket {ticket_id} is a member of {sets} status sets")]
    Membership {
        /// Offending ticket
        ticket_id: TicketId,
        /// Number of sets containing it
        sets: usize,
    },

    /// A status set holds a ticket missing from the catalog.
    #[error("ticket {ticket_id} is {status} but not in the catalog")]
    NotInCatalog {
        /// Offending ticket
        ticket_id: TicketId,
        /// Set containing it
        status: TicketStatus,
    },

    /// A Reserved ticket has no lease.
    #[error("reserved ticket {0} has no lease")]
    MissingLease(TicketId),

    /// A lease exists for a ticket that is not Reserved.
    #[error("ticket {0} has a lease but is not reserved")]
    LeaseWithoutReservation(TicketId),

    /// Lease index entry missing, stray, or scored differently from the lease.
    #[error("lease index entry of ticket {0} does not match its lease")]
    IndexMismatch(TicketId),

    /// The ordered index and the score map disagree.
    #[error("lease index is internally inconsistent")]
    IndexCorrupt,

    /// The store lock was poisoned.
    #[error("store lock poisoned")]
    Poisoned,
}

/// In-memory ticket store.
///
/// Clones share the same data.
///
/// # Example
///
/// ```
/// use leasehold_core::partition::Partitioner;
/// use leasehold_core::store::TicketStore;
/// use leasehold_core::types::{BatchId, Ticket};
/// use leasehold_testing::InMemoryTicketStore;
///
/// # async fn example() -> Result<(), leasehold_core::StoreError> {
/// let store = InMemoryTicketStore::new();
/// let partition = Partitioner::default().partition_key(&BatchId::new("90"));
///
/// store.provision(&partition, &[Ticket::new("1", "90", "Seat 1")]).await?;
/// assert_eq!(store.counts(&partition).await?.available, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryTicketStore {
    state: Arc<Mutex<State>>,
    unavailable: Arc<AtomicBool>,
    commits: Arc<AtomicUsize>,
    conflicts: Arc<AtomicUsize>,
}

impl InMemoryTicketStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`] (or stop doing so).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of commits attempted so far.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of commits rejected with [`CommitOutcome::Conflict`].
    #[must_use]
    pub fn conflict_count(&self) -> usize {
        self.conflicts.load(Ordering::SeqCst)
    }

    /// Lease index entries of a partition, in score order.
    #[must_use]
    pub fn index_entries(&self, partition: &PartitionKey) -> Vec<IndexEntry> {
        self.state
            .lock()
            .ok()
            .and_then(|state| {
                state.partitions.get(partition).map(|p| {
                    p.index
                        .iter()
                        .map(|(score, ticket_id)| IndexEntry {
                            ticket_id: ticket_id.clone(),
                            score: *score,
                        })
                        .collect()
                })
            })
            .unwrap_or_default()
    }

    /// Verify the storage invariants of every partition.
    ///
    /// - every catalog ticket is in exactly one status set
    /// - a lease exists if and only if the ticket is Reserved
    /// - the lease index holds exactly one entry per lease, scored with its deadline
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let state = self.state.lock().map_err(|_| InvariantViolation::Poisoned)?;
        state.partitions.values().try_for_each(Partition::check)
    }

    fn guard(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected fault".to_string()));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("Mutex lock failed".to_string()))
    }
}

impl TicketStore for InMemoryTicketStore {
    fn provision(
        &self,
        partition: &PartitionKey,
        tickets: &[Ticket],
    ) -> impl Future<Output = Result<usize, StoreError>> + Send {
        let result = self.guard().map(|mut state| {
            state.registry.insert(partition.batch_id().clone());
            let records = state.partitions.entry(partition.clone()).or_default();
            let mut added = 0;
            for ticket in tickets {
                if !records.catalog.contains_key(&ticket.ticket_id) {
                    records.catalog.insert(ticket.ticket_id.clone(), ticket.clone());
                    records.available.insert(ticket.ticket_id.clone());
                    added += 1;
                }
            }
            added
        });
        async move { result }
    }

    fn read(
        &self,
        partition: &PartitionKey,
        ticket_ids: &[TicketId],
    ) -> impl Future<Output = Result<Vec<TicketView>, StoreError>> + Send {
        let result = self.guard().map(|state| {
            let records = state.partitions.get(partition);
            ticket_ids
                .iter()
                .map(|ticket_id| match records {
                    Some(p) if p.catalog.contains_key(ticket_id) => TicketView {
                        ticket_id: ticket_id.clone(),
                        status: p.status_of(ticket_id),
                        lease: p.leases.get(ticket_id).cloned(),
                    },
                    _ => TicketView::unknown(ticket_id.clone()),
                })
                .collect()
        });
        async move { result }
    }

    fn expired(
        &self,
        partition: &PartitionKey,
        now: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<IndexEntry>, StoreError>> + Send {
        let cutoff = now.timestamp_millis();
        let result = self.guard().map(|state| {
            state
                .partitions
                .get(partition)
                .map(|p| {
                    p.index
                        .iter()
                        .take_while(|(score, _)| *score <= cutoff)
                        .skip(offset)
                        .take(limit)
                        .map(|(score, ticket_id)| IndexEntry {
                            ticket_id: ticket_id.clone(),
                            score: *score,
                        })
                        .collect()
                })
                .unwrap_or_default()
        });
        async move { result }
    }

    fn sample_available(
        &self,
        partition: &PartitionKey,
        count: usize,
    ) -> impl Future<Output = Result<Vec<TicketId>, StoreError>> + Send {
        let result = self.guard().map(|state| {
            state
                .partitions
                .get(partition)
                .map(|p| {
                    p.available
                        .iter()
                        .cloned()
                        .choose_multiple(&mut rand::thread_rng(), count)
                })
                .unwrap_or_default()
        });
        async move { result }
    }

    fn commit(
        &self,
        partition: &PartitionKey,
        writes: WriteSet,
    ) -> impl Future<Output = Result<CommitOutcome, StoreError>> + Send {
        let result = self.guard().map(|mut state| {
            self.commits.fetch_add(1, Ordering::SeqCst);
            let records = state.partitions.entry(partition.clone()).or_default();
            if !writes.preconditions.iter().all(|p| records.holds(p)) {
                self.conflicts.fetch_add(1, Ordering::SeqCst);
                return CommitOutcome::Conflict;
            }
            for mutation in writes.mutations {
                records.apply(mutation);
            }
            CommitOutcome::Committed
        });
        async move { result }
    }

    fn ticket(
        &self,
        partition: &PartitionKey,
        ticket_id: &TicketId,
    ) -> impl Future<Output = Result<Option<Ticket>, StoreError>> + Send {
        let result = self.guard().map(|state| {
            state
                .partitions
                .get(partition)
                .and_then(|p| p.catalog.get(ticket_id).cloned())
        });
        async move { result }
    }

    fn counts(
        &self,
        partition: &PartitionKey,
    ) -> impl Future<Output = Result<StatusCounts, StoreError>> + Send {
        let result = self.guard().map(|state| {
            state
                .partitions
                .get(partition)
                .map(|p| StatusCounts {
                    available: p.available.len(),
                    reserved: p.reserved.len(),
                    sold: p.sold.len(),
                })
                .unwrap_or_default()
        });
        async move { result }
    }

    fn batches(&self) -> impl Future<Output = Result<Vec<BatchId>, StoreError>> + Send {
        let result = self
            .guard()
            .map(|state| state.registry.iter().cloned().collect());
        async move { result }
    }
}
