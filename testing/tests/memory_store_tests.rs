//! Contract tests for `InMemoryTicketStore`.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use chrono::{DateTime, TimeDelta, Utc};
use leasehold_core::environment::Clock;
use leasehold_core::partition::{PartitionKey, Partitioner};
use leasehold_core::store::{CommitOutcome, Mutation, Precondition, TicketStore, WriteSet};
use leasehold_core::types::{BatchId, HolderId, Lease, LeaseId, TicketId, TicketStatus};
use leasehold_core::StoreError;
use leasehold_testing::{InMemoryTicketStore, InvariantViolation, test_clock, tickets};

fn partition(batch: &str) -> PartitionKey {
    Partitioner::default().partition_key(&BatchId::new(batch))
}

fn lease(ticket: &str, expires_at: DateTime<Utc>) -> Lease {
    Lease {
        ticket_id: TicketId::new(ticket),
        lease_id: LeaseId::new(),
        holder_id: HolderId::new("h"),
        expires_at,
    }
}

/// Write set reserving `ticket` under `lease` the way the engine does.
fn reserve_writes(lease: &Lease) -> WriteSet {
    let mut writes = WriteSet::default();
    writes.require(Precondition::Status {
        ticket_id: lease.ticket_id.clone(),
        expected: TicketStatus::Available,
    });
    writes.require(Precondition::Lease {
        ticket_id: lease.ticket_id.clone(),
        expected: None,
    });
    writes.push(Mutation::Move {
        ticket_id: lease.ticket_id.clone(),
        from: TicketStatus::Available,
        to: TicketStatus::Reserved,
    });
    writes.push(Mutation::IndexInsert {
        ticket_id: lease.ticket_id.clone(),
        score: lease.expiry_score(),
    });
    writes.push(Mutation::PutLease(lease.clone()));
    writes
}

#[tokio::test]
async fn provisioning_is_write_once() {
    let store = InMemoryTicketStore::new();
    let key = partition("90");
    let catalog = tickets(&BatchId::new("90"), 5);

    assert_eq!(store.provision(&key, &catalog).await.unwrap(), 5);
    assert_eq!(store.provision(&key, &catalog[..3]).await.unwrap(), 0);

    let counts = store.counts(&key).await.unwrap();
    assert_eq!(counts.available, 5);
    assert_eq!(counts.total(), 5);
    assert_eq!(store.batches().await.unwrap(), vec![BatchId::new("90")]);
    assert_eq!(
        store.ticket(&key, &TicketId::new("2")).await.unwrap().map(|t| t.descriptor),
        Some("Seat 2".to_string())
    );
    store.check_invariants().unwrap();
}

#[tokio::test]
async fn failed_precondition_applies_nothing() {
    let store = InMemoryTicketStore::new();
    let key = partition("90");
    store.provision(&key, &tickets(&BatchId::new("90"), 2)).await.unwrap();

    let now = test_clock().now();
    let first = lease("1", now + TimeDelta::seconds(30));
    assert_eq!(store.commit(&key, reserve_writes(&first)).await.unwrap(), CommitOutcome::Committed);

    // Ticket 2 is still Available, ticket 1 no longer is: the whole set must abort
    let mut writes = reserve_writes(&lease("2", now + TimeDelta::seconds(30)));
    let again = reserve_writes(&lease("1", now + TimeDelta::seconds(60)));
    writes.preconditions.extend(again.preconditions);
    writes.mutations.extend(again.mutations);

    assert_eq!(store.commit(&key, writes).await.unwrap(), CommitOutcome::Conflict);
    assert_eq!(store.conflict_count(), 1);

    let views = store
        .read(&key, &[TicketId::new("1"), TicketId::new("2")])
        .await
        .unwrap();
    assert_eq!(views[0].lease_id(), Some(first.lease_id));
    assert_eq!(views[1].status, Some(TicketStatus::Available));
    assert!(views[1].lease.is_none());
    store.check_invariants().unwrap();
}

#[tokio::test]
async fn expired_returns_oldest_first_up_to_limit() {
    let store = InMemoryTicketStore::new();
    let key = partition("90");
    store.provision(&key, &tickets(&BatchId::new("90"), 4)).await.unwrap();

    let now = test_clock().now();
    for (ticket, offset) in [("1", -5), ("2", -10), ("3", 0), ("4", 10)] {
        let lease = lease(ticket, now + TimeDelta::seconds(offset));
        store.commit(&key, reserve_writes(&lease)).await.unwrap();
    }

    let expired = store.expired(&key, now, 0, 10).await.unwrap();
    let order: Vec<_> = expired.iter().map(|e| e.ticket_id.as_str().to_string()).collect();
    assert_eq!(order, vec!["2", "1", "3"]);

    let page = store.expired(&key, now, 0, 2).await.unwrap();
    assert_eq!(page.len(), 2);

    let rest = store.expired(&key, now, 2, 2).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].ticket_id, TicketId::new("3"));
}

#[tokio::test]
async fn index_insert_rescores_in_place() {
    let store = InMemoryTicketStore::new();
    let key = partition("90");
    store.provision(&key, &tickets(&BatchId::new("90"), 1)).await.unwrap();

    let now = test_clock().now();
    let original = lease("1", now + TimeDelta::seconds(5));
    store.commit(&key, reserve_writes(&original)).await.unwrap();

    let extended = lease("1", now + TimeDelta::seconds(50));
    let mut writes = WriteSet::default();
    writes.push(Mutation::PutLease(extended.clone()));
    writes.push(Mutation::IndexInsert {
        ticket_id: extended.ticket_id.clone(),
        score: extended.expiry_score(),
    });
    store.commit(&key, writes).await.unwrap();

    let entries = store.index_entries(&key);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].score, extended.expiry_score());
    store.check_invariants().unwrap();
}

#[tokio::test]
async fn sample_available_is_distinct_and_bounded() {
    let store = InMemoryTicketStore::new();
    let key = partition("90");
    store.provision(&key, &tickets(&BatchId::new("90"), 5)).await.unwrap();

    let mut sample = store.sample_available(&key, 3).await.unwrap();
    sample.sort();
    sample.dedup();
    assert_eq!(sample.len(), 3);

    assert_eq!(store.sample_available(&key, 10).await.unwrap().len(), 5);
    assert!(store.sample_available(&partition("other"), 1).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_tickets_read_as_unknown() {
    let store = InMemoryTicketStore::new();
    let key = partition("90");
    store.provision(&key, &tickets(&BatchId::new("90"), 1)).await.unwrap();

    let views = store.read(&partition("91"), &[TicketId::new("1")]).await.unwrap();
    assert_eq!(views[0].status, None);
}

#[tokio::test]
async fn injected_fault_fails_every_call() {
    let store = InMemoryTicketStore::new();
    let key = partition("90");
    store.set_unavailable(true);

    assert!(matches!(
        store.provision(&key, &tickets(&BatchId::new("90"), 1)).await,
        Err(StoreError::Unavailable(_))
    ));
    assert!(matches!(store.batches().await, Err(StoreError::Unavailable(_))));

    store.set_unavailable(false);
    assert!(store.batches().await.is_ok());
}

#[tokio::test]
async fn invariant_checker_catches_lease_drift() {
    let store = InMemoryTicketStore::new();
    let key = partition("90");
    store.provision(&key, &tickets(&BatchId::new("90"), 1)).await.unwrap();

    // A move without a lease leaves a Reserved ticket unprotected
    let mut writes = WriteSet::default();
    writes.push(Mutation::Move {
        ticket_id: TicketId::new("1"),
        from: TicketStatus::Available,
        to: TicketStatus::Reserved,
    });
    store.commit(&key, writes).await.unwrap();

    assert_eq!(
        store.check_invariants(),
        Err(InvariantViolation::MissingLease(TicketId::new("1")))
    );
}
