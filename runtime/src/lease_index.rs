//! Lease index: expiry-ordered lookup of reserved tickets.
//!
//! Every lease has exactly one index entry, scored with its deadline in unix
//! milliseconds. Index entries are only ever written inside the same
//! [`WriteSet`] that writes the lease itself, so the index and the lease records
//! cannot drift apart; [`insert`] and [`remove`] build those mutations.
//!
//! [`LeaseIndex::pop_expired`] turns lapsed entries back into Available tickets.
//! Each reclamation is its own atomic commit that re-validates the exact lease
//! it observed, so a lease that was confirmed, released, extended or replaced in
//! the meantime is left alone.

use crate::plan::{self, Reclaim};
use chrono::{DateTime, Utc};
use leasehold_core::partition::Partitioner;
use leasehold_core::store::{CommitOutcome, Mutation, TicketStore, WriteSet};
use leasehold_core::types::{BatchId, Lease, TicketId};
use leasehold_core::StoreError;
use std::sync::Arc;

/// Add the index entry for `lease` (replacing any previous score).
pub fn insert(writes: &mut WriteSet, lease: &Lease) {
    writes.push(Mutation::IndexInsert {
        ticket_id: lease.ticket_id.clone(),
        score: lease.expiry_score(),
    });
}

/// Drop the index entry of `ticket_id`.
pub fn remove(writes: &mut WriteSet, ticket_id: &TicketId) {
    writes.push(Mutation::IndexRemove(ticket_id.clone()));
}

/// Reclaims lapsed leases of one store.
pub struct LeaseIndex<S> {
    store: Arc<S>,
    partitioner: Partitioner,
}

impl<S> Clone for LeaseIndex<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            partitioner: self.partitioner.clone(),
        }
    }
}

impl<S: TicketStore> LeaseIndex<S> {
    /// Create a lease index over `store`.
    #[must_use]
    pub const fn new(store: Arc<S>, partitioner: Partitioner) -> Self {
        Self { store, partitioner }
    }

    /// Reclaim up to `limit` leases of `batch_id` that expired at or before `now`.
    ///
    /// For every expired entry the ticket is moved Reserved → Available, its
    /// lease deleted and its entry removed, in one commit conditioned on the
    /// ticket still being Reserved under the very lease that was read. Entries
    /// whose lease no longer exists are dropped under a "no lease" condition.
    /// A lost race is not an error; the entry is simply skipped.
    ///
    /// # Returns
    ///
    /// Ids of the tickets returned to Available, oldest deadline first.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails. Reclamations committed before the
    /// failure stay committed.
    pub async fn pop_expired(
        &self,
        batch_id: &BatchId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TicketId>, StoreError> {
        Ok(self.pop_expired_page(batch_id, now, 0, limit).await?.reclaimed)
    }

    /// Like [`pop_expired`](Self::pop_expired), but starts `offset` entries
    /// into the expired range and reports how many entries it left behind.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails.
    pub async fn pop_expired_page(
        &self,
        batch_id: &BatchId,
        now: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<ExpiredPage, StoreError> {
        let mut page = ExpiredPage::default();
        if limit == 0 {
            return Ok(page);
        }

        let partition = self.partitioner.partition_key(batch_id);
        let entries = self.store.expired(&partition, now, offset, limit).await?;
        if entries.is_empty() {
            return Ok(page);
        }
        page.scanned = entries.len();

        let ids: Vec<TicketId> = entries.into_iter().map(|e| e.ticket_id).collect();
        let views = self.store.read(&partition, &ids).await?;

        for view in &views {
            match plan::reclaim(view, now) {
                Reclaim::Expired(writes) => {
                    if self.store.commit(&partition, writes).await? == CommitOutcome::Committed {
                        page.reclaimed.push(view.ticket_id.clone());
                    } else {
                        page.retained += 1;
                        tracing::debug!(
                            batch = %batch_id,
                            ticket = %view.ticket_id,
                            "Lease changed before reclamation, skipping"
                        );
                    }
                }
                Reclaim::Stale(writes) => {
                    let outcome = self.store.commit(&partition, writes).await?;
                    if outcome != CommitOutcome::Committed {
                        page.retained += 1;
                    }
                    tracing::debug!(
                        batch = %batch_id,
                        ticket = %view.ticket_id,
                        removed = outcome == CommitOutcome::Committed,
                        "Dropped index entry without a lease"
                    );
                }
                Reclaim::Live => page.retained += 1,
                Reclaim::Inconsistent => {
                    page.retained += 1;
                    tracing::warn!(
                        batch = %batch_id,
                        ticket = %view.ticket_id,
                        status = ?view.status,
                        "Index entry points at a ticket whose status and lease disagree"
                    );
                }
            }
        }

        Ok(page)
    }
}

/// One page of [`LeaseIndex::pop_expired_page`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpiredPage {
    /// Index entries read
    pub scanned: usize,
    /// Tickets returned to Available
    pub reclaimed: Vec<TicketId>,
    /// Entries still in the index afterwards
    pub retained: usize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use leasehold_core::types::{HolderId, LeaseId};

    #[test]
    fn index_mutations_follow_the_lease() {
        let lease = Lease {
            ticket_id: TicketId::new("3"),
            lease_id: LeaseId::new(),
            holder_id: HolderId::new("h"),
            expires_at: DateTime::from_timestamp_millis(1_700_000_000_123).unwrap(),
        };

        let mut writes = WriteSet::default();
        insert(&mut writes, &lease);
        remove(&mut writes, &lease.ticket_id);

        assert_eq!(
            writes.mutations,
            vec![
                Mutation::IndexInsert { ticket_id: TicketId::new("3"), score: 1_700_000_000_123 },
                Mutation::IndexRemove(TicketId::new("3")),
            ]
        );
    }
}
