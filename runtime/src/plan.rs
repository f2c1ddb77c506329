//! Transition planning.
//!
//! Each function here maps a snapshot of ticket views to the write set that
//! performs the transition plus the outcome reported if that write set commits.
//! Planning is pure: no I/O, and the clock reading is passed in, so every rule
//! of the lease state machine is unit-tested right here.
//!
//! Every touched ticket is pinned (status and lease id) so the commit aborts
//! if anything the plan relied on changed after the snapshot.

use crate::lease_index;
use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use leasehold_core::outcome::{
    ConfirmOutcome, RejectReason, Rejection, ReserveOutcome, ReservedTicket, RollbackOutcome,
};
use leasehold_core::store::{Mutation, Precondition, TicketView, WriteSet};
use leasehold_core::types::{HolderId, Lease, LeaseId, TicketStatus};

/// A planned transition.
#[derive(Debug)]
pub struct Plan<T> {
    /// Write set to commit; empty when nothing changes
    pub writes: WriteSet,
    /// Outcome to report if the write set commits
    pub outcome: T,
    /// Expired leases of other holders taken over by this plan
    pub inline_reclaims: usize,
}

impl<T: Default> Plan<T> {
    fn empty() -> Self {
        Self {
            writes: WriteSet::default(),
            outcome: T::default(),
            inline_reclaims: 0,
        }
    }
}

/// Deadline of a lease granted at `now`, truncated to the index resolution.
pub fn lease_deadline(now: DateTime<Utc>, duration: TimeDelta) -> DateTime<Utc> {
    (now + duration).trunc_subsecs(3)
}

/// Plan `Reserve` of every viewed ticket for `holder`.
pub fn reserve(
    views: &[TicketView],
    holder: &HolderId,
    now: DateTime<Utc>,
    duration: TimeDelta,
) -> Plan<ReserveOutcome> {
    let deadline = lease_deadline(now, duration);
    let mut plan = Plan::<ReserveOutcome>::empty();

    for view in views {
        let reject = |reason| Rejection::new(view.ticket_id.clone(), reason);
        match (view.status, &view.lease) {
            (None, _) => plan.outcome.rejected.push(reject(RejectReason::UnknownTicket)),
            (Some(TicketStatus::Available), None) => {
                let granted = grant(&mut plan.writes, view, TicketStatus::Available, holder, deadline);
                plan.outcome.reserved.push(granted);
            }
            (Some(TicketStatus::Reserved), Some(lease)) if lease.is_live(now) => {
                if !lease.is_held_by(holder) {
                    plan.outcome.rejected.push(reject(RejectReason::NotAvailable));
                } else if deadline > lease.expires_at {
                    let granted = grant(&mut plan.writes, view, TicketStatus::Reserved, holder, deadline);
                    plan.outcome.reserved.push(granted);
                } else {
                    plan.outcome.reserved.push(ReservedTicket {
                        ticket_id: view.ticket_id.clone(),
                        lease_id: lease.lease_id,
                        expires_at: lease.expires_at,
                    });
                }
            }
            (Some(TicketStatus::Reserved), Some(lease)) => {
                if !lease.is_held_by(holder) {
                    plan.inline_reclaims += 1;
                }
                let granted = grant(&mut plan.writes, view, TicketStatus::Reserved, holder, deadline);
                plan.outcome.reserved.push(granted);
            }
            _ => plan.outcome.rejected.push(reject(RejectReason::NotAvailable)),
        }
    }

    plan
}

/// Plan an all-or-nothing reservation of sampled tickets.
///
/// Returns `None` if any sampled ticket is no longer Available, meaning the
/// sample raced with another writer and should be redrawn.
pub fn reserve_all(
    views: &[TicketView],
    holder: &HolderId,
    now: DateTime<Utc>,
    duration: TimeDelta,
) -> Option<Plan<Vec<ReservedTicket>>> {
    let deadline = lease_deadline(now, duration);
    let mut plan = Plan::<Vec<ReservedTicket>>::empty();

    for view in views {
        if view.status != Some(TicketStatus::Available) || view.lease.is_some() {
            return None;
        }
        let granted = grant(&mut plan.writes, view, TicketStatus::Available, holder, deadline);
        plan.outcome.push(granted);
    }

    Some(plan)
}

/// Plan `Confirm` of every viewed ticket for `holder`.
pub fn confirm(views: &[TicketView], holder: &HolderId, now: DateTime<Utc>) -> Plan<ConfirmOutcome> {
    let mut plan = Plan::<ConfirmOutcome>::empty();

    for view in views {
        let reason = match (view.status, &view.lease) {
            (None, _) => Some(RejectReason::UnknownTicket),
            (Some(TicketStatus::Sold), _) => Some(RejectReason::AlreadySold),
            (Some(TicketStatus::Reserved), Some(lease)) if lease.is_live(now) => {
                if lease.is_held_by(holder) {
                    release(&mut plan.writes, view, TicketStatus::Sold);
                    plan.outcome.confirmed.push(view.ticket_id.clone());
                    None
                } else {
                    Some(RejectReason::WrongHolder)
                }
            }
            // Lapsed, reclaimed, or never reserved: no live lease to confirm.
            _ => Some(RejectReason::LeaseExpired),
        };
        if let Some(reason) = reason {
            plan.outcome.rejected.push(Rejection::new(view.ticket_id.clone(), reason));
        }
    }

    plan
}

/// Plan `Rollback` of every viewed ticket for `holder`.
///
/// A lease past its deadline counts as not reserved, whoever holds it; the
/// sweeper or the next reservation returns the ticket to Available.
pub fn rollback(views: &[TicketView], holder: &HolderId, now: DateTime<Utc>) -> Plan<RollbackOutcome> {
    let mut plan = Plan::<RollbackOutcome>::empty();

    for view in views {
        let reason = match (view.status, &view.lease) {
            (None, _) => Some(RejectReason::UnknownTicket),
            (Some(TicketStatus::Reserved), Some(lease))
                if lease.is_live(now) && lease.is_held_by(holder) =>
            {
                release(&mut plan.writes, view, TicketStatus::Available);
                plan.outcome.released.push(view.ticket_id.clone());
                None
            }
            (Some(TicketStatus::Reserved), Some(lease)) if lease.is_live(now) => {
                Some(RejectReason::WrongHolder)
            }
            _ => Some(RejectReason::NotReserved),
        };
        if let Some(reason) = reason {
            plan.outcome.rejected.push(Rejection::new(view.ticket_id.clone(), reason));
        }
    }

    plan
}

/// What the sweeper should do with one expired index entry.
#[derive(Debug)]
pub enum Reclaim {
    /// The observed lease is past its deadline: return the ticket to Available.
    Expired(WriteSet),
    /// No lease backs the entry: drop the entry.
    Stale(WriteSet),
    /// The ticket is held by a lease that has not expired.
    Live,
    /// Status and lease disagree; leave it for an operator.
    Inconsistent,
}

/// Plan the reclamation of the ticket behind an expired index entry.
pub fn reclaim(view: &TicketView, now: DateTime<Utc>) -> Reclaim {
    match (view.status, &view.lease) {
        (_, Some(lease)) if lease.is_live(now) => Reclaim::Live,
        (Some(TicketStatus::Reserved), Some(_)) => {
            let mut writes = WriteSet::default();
            release(&mut writes, view, TicketStatus::Available);
            Reclaim::Expired(writes)
        }
        (Some(TicketStatus::Reserved), None) | (_, Some(_)) => Reclaim::Inconsistent,
        (_, None) => {
            let mut writes = WriteSet::default();
            writes.require(Precondition::Lease {
                ticket_id: view.ticket_id.clone(),
                expected: None,
            });
            lease_index::remove(&mut writes, &view.ticket_id);
            Reclaim::Stale(writes)
        }
    }
}

/// Pin `view` in `from` and put a fresh lease for `holder` on it.
fn grant(
    writes: &mut WriteSet,
    view: &TicketView,
    from: TicketStatus,
    holder: &HolderId,
    expires_at: DateTime<Utc>,
) -> ReservedTicket {
    let lease = Lease {
        ticket_id: view.ticket_id.clone(),
        lease_id: LeaseId::new(),
        holder_id: holder.clone(),
        expires_at,
    };

    writes.pin(view, from);
    if from != TicketStatus::Reserved {
        writes.push(Mutation::Move {
            ticket_id: view.ticket_id.clone(),
            from,
            to: TicketStatus::Reserved,
        });
    }
    lease_index::insert(writes, &lease);
    writes.push(Mutation::PutLease(lease.clone()));

    ReservedTicket {
        ticket_id: lease.ticket_id,
        lease_id: lease.lease_id,
        expires_at: lease.expires_at,
    }
}

/// Pin a Reserved `view` and move it to `to`, dropping lease and index entry.
fn release(writes: &mut WriteSet, view: &TicketView, to: TicketStatus) {
    writes.pin(view, TicketStatus::Reserved);
    writes.push(Mutation::Move {
        ticket_id: view.ticket_id.clone(),
        from: TicketStatus::Reserved,
        to,
    });
    writes.push(Mutation::DeleteLease(view.ticket_id.clone()));
    lease_index::remove(writes, &view.ticket_id);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use leasehold_core::types::TicketId;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    fn holder(name: &str) -> HolderId {
        HolderId::new(name)
    }

    fn available(id: &str) -> TicketView {
        TicketView {
            ticket_id: TicketId::new(id),
            status: Some(TicketStatus::Available),
            lease: None,
        }
    }

    fn sold(id: &str) -> TicketView {
        TicketView {
            ticket_id: TicketId::new(id),
            status: Some(TicketStatus::Sold),
            lease: None,
        }
    }

    fn reserved(id: &str, by: &str, expires_in: TimeDelta) -> TicketView {
        TicketView {
            ticket_id: TicketId::new(id),
            status: Some(TicketStatus::Reserved),
            lease: Some(Lease {
                ticket_id: TicketId::new(id),
                lease_id: LeaseId::new(),
                holder_id: holder(by),
                expires_at: now() + expires_in,
            }),
        }
    }

    fn secs(n: i64) -> TimeDelta {
        TimeDelta::try_seconds(n).unwrap()
    }

    #[test]
    fn reserve_available_moves_leases_and_indexes() {
        let plan = reserve(&[available("1")], &holder("h"), now(), secs(30));

        assert_eq!(plan.outcome.reserved.len(), 1);
        assert!(plan.outcome.rejected.is_empty());
        assert_eq!(plan.outcome.reserved[0].expires_at, now() + secs(30));
        assert!(plan.writes.mutations.contains(&Mutation::Move {
            ticket_id: TicketId::new("1"),
            from: TicketStatus::Available,
            to: TicketStatus::Reserved,
        }));
        assert!(plan.writes.mutations.contains(&Mutation::IndexInsert {
            ticket_id: TicketId::new("1"),
            score: (now() + secs(30)).timestamp_millis(),
        }));
        assert!(plan.writes.preconditions.contains(&Precondition::Lease {
            ticket_id: TicketId::new("1"),
            expected: None,
        }));
    }

    #[test]
    fn reserve_rejects_live_foreign_lease_sold_and_unknown() {
        let views = [
            reserved("1", "other", secs(10)),
            sold("2"),
            TicketView::unknown(TicketId::new("3")),
        ];
        let plan = reserve(&views, &holder("h"), now(), secs(30));

        assert!(plan.writes.is_empty());
        assert!(plan.outcome.reserved.is_empty());
        assert_eq!(plan.outcome.rejection_for(&TicketId::new("1")), Some(RejectReason::NotAvailable));
        assert_eq!(plan.outcome.rejection_for(&TicketId::new("2")), Some(RejectReason::NotAvailable));
        assert_eq!(plan.outcome.rejection_for(&TicketId::new("3")), Some(RejectReason::UnknownTicket));
    }

    #[test]
    fn re_reserve_by_holder_extends_with_new_lease_version() {
        let view = reserved("1", "h", secs(5));
        let old_id = view.lease_id().unwrap();
        let plan = reserve(&[view], &holder("h"), now(), secs(30));

        let granted = &plan.outcome.reserved[0];
        assert_ne!(granted.lease_id, old_id);
        assert_eq!(granted.expires_at, now() + secs(30));
        // Stays Reserved: no move, one lease, one index entry
        assert!(!plan.writes.mutations.iter().any(|m| matches!(m, Mutation::Move { .. })));
        assert_eq!(
            plan.writes.mutations.iter().filter(|m| matches!(m, Mutation::IndexInsert { .. })).count(),
            1
        );
        assert!(plan.writes.preconditions.contains(&Precondition::Lease {
            ticket_id: TicketId::new("1"),
            expected: Some(old_id),
        }));
    }

    #[test]
    fn re_reserve_never_shortens() {
        let view = reserved("1", "h", secs(60));
        let old = view.lease.clone().unwrap();
        let plan = reserve(&[view], &holder("h"), now(), secs(30));

        assert!(plan.writes.is_empty());
        assert_eq!(plan.outcome.reserved[0].lease_id, old.lease_id);
        assert_eq!(plan.outcome.reserved[0].expires_at, old.expires_at);
    }

    #[test]
    fn reserve_takes_over_expired_lease() {
        let plan = reserve(&[reserved("1", "other", secs(-1))], &holder("h"), now(), secs(30));

        assert_eq!(plan.outcome.reserved.len(), 1);
        assert_eq!(plan.inline_reclaims, 1);
        assert!(plan.writes.mutations.iter().any(|m| matches!(
            m,
            Mutation::PutLease(lease) if lease.holder_id == holder("h")
        )));
    }

    #[test]
    fn lease_at_exact_deadline_is_expired() {
        let plan = confirm(&[reserved("1", "h", TimeDelta::zero())], &holder("h"), now());
        assert_eq!(plan.outcome.rejection_for(&TicketId::new("1")), Some(RejectReason::LeaseExpired));
    }

    #[test]
    fn deadline_is_truncated_to_milliseconds() {
        let at = now() + TimeDelta::microseconds(1_999);
        assert_eq!(lease_deadline(at, secs(1)), now() + secs(1) + TimeDelta::milliseconds(1));
    }

    #[test]
    fn confirm_outcomes() {
        let views = [
            reserved("mine", "h", secs(10)),
            reserved("theirs", "other", secs(10)),
            reserved("lapsed", "h", secs(-1)),
            available("free"),
            sold("gone"),
            TicketView::unknown(TicketId::new("nope")),
        ];
        let plan = confirm(&views, &holder("h"), now());

        assert_eq!(plan.outcome.confirmed, vec![TicketId::new("mine")]);
        let reason = |id: &str| plan.outcome.rejection_for(&TicketId::new(id));
        assert_eq!(reason("theirs"), Some(RejectReason::WrongHolder));
        assert_eq!(reason("lapsed"), Some(RejectReason::LeaseExpired));
        assert_eq!(reason("free"), Some(RejectReason::LeaseExpired));
        assert_eq!(reason("gone"), Some(RejectReason::AlreadySold));
        assert_eq!(reason("nope"), Some(RejectReason::UnknownTicket));
        assert!(plan.writes.mutations.contains(&Mutation::DeleteLease(TicketId::new("mine"))));
    }

    #[test]
    fn rollback_outcomes() {
        let views = [
            reserved("mine", "h", secs(10)),
            reserved("mine-lapsed", "h", secs(-1)),
            reserved("theirs", "other", secs(10)),
            reserved("theirs-lapsed", "other", secs(-1)),
            available("free"),
            sold("gone"),
        ];
        let plan = rollback(&views, &holder("h"), now());

        assert_eq!(plan.outcome.released, vec![TicketId::new("mine")]);
        let reason = |id: &str| plan.outcome.rejection_for(&TicketId::new(id));
        assert_eq!(reason("mine-lapsed"), Some(RejectReason::NotReserved));
        assert_eq!(reason("theirs"), Some(RejectReason::WrongHolder));
        assert_eq!(reason("theirs-lapsed"), Some(RejectReason::NotReserved));
        assert_eq!(reason("free"), Some(RejectReason::NotReserved));
        assert_eq!(reason("gone"), Some(RejectReason::NotReserved));
    }

    #[test]
    fn reserve_all_requires_every_sample_available() {
        let ok = reserve_all(&[available("1"), available("2")], &holder("h"), now(), secs(30));
        assert_eq!(ok.map(|p| p.outcome.len()), Some(2));

        let raced = reserve_all(
            &[available("1"), reserved("2", "x", secs(5))],
            &holder("h"),
            now(),
            secs(30),
        );
        assert!(raced.is_none());
    }

    #[test]
    fn reclaim_decisions() {
        assert!(matches!(reclaim(&reserved("1", "h", secs(-1)), now()), Reclaim::Expired(_)));
        assert!(matches!(reclaim(&reserved("1", "h", secs(1)), now()), Reclaim::Live));
        assert!(matches!(reclaim(&available("1"), now()), Reclaim::Stale(_)));
        assert!(matches!(reclaim(&sold("1"), now()), Reclaim::Stale(_)));

        let corrupt = TicketView { lease: None, ..reserved("1", "h", secs(-1)) };
        assert!(matches!(reclaim(&corrupt, now()), Reclaim::Inconsistent));
    }

    #[test]
    fn expired_reclaim_pins_the_observed_lease() {
        let view = reserved("1", "h", secs(-1));
        let Reclaim::Expired(writes) = reclaim(&view, now()) else {
            unreachable!("expected an expired reclaim");
        };

        assert!(writes.preconditions.contains(&Precondition::Lease {
            ticket_id: TicketId::new("1"),
            expected: view.lease_id(),
        }));
        assert!(writes.mutations.contains(&Mutation::Move {
            ticket_id: TicketId::new("1"),
            from: TicketStatus::Reserved,
            to: TicketStatus::Available,
        }));
    }
}
