//! The transition engine: Reserve, Confirm and Rollback over a [`TicketStore`].
//!
//! Every call runs the same optimistic unit of work:
//!
//! 1. read a snapshot of the requested tickets
//! 2. plan the transition ([`crate::plan`])
//! 3. commit the plan's write set, or learn that a precondition failed
//!
//! A failed precondition means a concurrent writer touched one of the tickets
//! between the read and the commit. Nothing was applied, so the engine simply
//! reads again and re-plans, up to [`EngineConfig::max_commit_attempts`] times.
//! Store faults are returned to the caller as they are.

use crate::config::EngineConfig;
use crate::lease_index::LeaseIndex;
use crate::metrics::EngineMetrics;
use crate::plan::{self, Plan};
use crate::sweeper::ExpirySweeper;
use chrono::{DateTime, TimeDelta, Utc};
use leasehold_core::environment::Clock;
use leasehold_core::outcome::{
    ConfirmOutcome, Rejection, ReserveAnyOutcome, ReserveOutcome, RollbackOutcome, StatusCounts,
};
use leasehold_core::partition::{PartitionKey, Partitioner};
use leasehold_core::store::{CommitOutcome, TicketStore, TicketView};
use leasehold_core::types::{BatchId, HolderId, Ticket, TicketId};
use leasehold_core::EngineError;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// Applies lease transitions to one backing store.
///
/// Cheap to clone: clones share the store handle and the clock.
///
/// # Example
///
/// ```no_run
/// use leasehold_core::environment::SystemClock;
/// use leasehold_core::types::{BatchId, HolderId, TicketId};
/// use leasehold_core::TicketStore;
/// use leasehold_runtime::{EngineConfig, TransitionEngine};
/// use std::sync::Arc;
///
/// # async fn example<S: TicketStore>(store: Arc<S>) -> Result<(), leasehold_core::EngineError> {
/// let engine = TransitionEngine::new(store, Arc::new(SystemClock), EngineConfig::default());
///
/// let batch = BatchId::new("90");
/// let holder = HolderId::new("session-1");
/// let seats = [TicketId::new("A-1"), TicketId::new("A-2")];
///
/// let held = engine.reserve(&batch, &seats, &holder, 30).await?;
/// engine.confirm(&batch, &held.reserved_ids(), &holder).await?;
/// # Ok(())
/// # }
/// ```
pub struct TransitionEngine<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    partitioner: Partitioner,
    config: EngineConfig,
}

impl<S> Clone for TransitionEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            partitioner: self.partitioner.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: TicketStore> TransitionEngine<S> {
    /// Create an engine over `store`.
    #[must_use]
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, mut config: EngineConfig) -> Self {
        config.max_commit_attempts = config.max_commit_attempts.max(1);
        Self {
            store,
            clock,
            partitioner: config.partitioner(),
            config,
        }
    }

    /// Backing store handle.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Partitioner derived from the configuration.
    #[must_use]
    pub const fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }

    /// Lease duration to use when the caller has no preference.
    #[must_use]
    pub const fn default_lease_seconds(&self) -> u64 {
        self.config.default_lease_seconds
    }

    /// Lease index over the same store and partitioner.
    #[must_use]
    pub fn lease_index(&self) -> LeaseIndex<S> {
        LeaseIndex::new(Arc::clone(&self.store), self.partitioner.clone())
    }

    /// Build an expiry sweeper sharing this engine's store, clock and configuration.
    ///
    /// Returns the sweeper and its shutdown sender.
    #[must_use]
    pub fn sweeper(&self) -> (ExpirySweeper<S>, watch::Sender<bool>) {
        ExpirySweeper::new(Arc::clone(&self.store), Arc::clone(&self.clock), &self.config)
    }

    /// Write tickets into the catalog of `batch_id` as Available.
    ///
    /// Tickets already in the catalog are left untouched, so provisioning is
    /// idempotent. Duplicate ids within `tickets` keep their first occurrence.
    ///
    /// # Returns
    ///
    /// Number of newly provisioned tickets.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidRequest`] if a ticket belongs to another batch
    /// or has an empty id, and a store error if the write fails.
    pub async fn provision(&self, batch_id: &BatchId, tickets: &[Ticket]) -> Result<usize, EngineError> {
        validate_batch(batch_id)?;
        if let Some(foreign) = tickets.iter().find(|t| &t.batch_id != batch_id) {
            return Err(EngineError::InvalidRequest(format!(
                "ticket {} belongs to batch {}, not {batch_id}",
                foreign.ticket_id, foreign.batch_id
            )));
        }
        if tickets.iter().any(|t| t.ticket_id.is_empty()) {
            return Err(EngineError::InvalidRequest("ticket id must not be empty".to_string()));
        }

        let mut seen = HashSet::new();
        let unique: Vec<Ticket> = tickets
            .iter()
            .filter(|t| seen.insert(t.ticket_id.clone()))
            .cloned()
            .collect();
        if unique.is_empty() {
            return Ok(0);
        }

        let partition = self.partitioner.partition_key(batch_id);
        let added = self.store.provision(&partition, &unique).await?;

        tracing::info!(
            batch = %batch_id,
            requested = unique.len(),
            added,
            "Provisioned tickets"
        );
        Ok(added)
    }

    /// Reserve specific tickets of `batch_id` for `holder_id`.
    ///
    /// Tickets that are Available, or whose lease has expired, are leased to the
    /// holder for `lease_seconds`. Tickets the holder already leases count as
    /// reserved; their lease is extended if the new deadline is later. Every
    /// accepted ticket moves in one atomic commit; the rest are reported in
    /// [`ReserveOutcome::rejected`].
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidRequest`]: empty ticket list or holder, zero or
    ///   oversized lease, or a malformed batch id
    /// - [`EngineError::BackingStoreUnavailable`]: the store could not be reached
    /// - [`EngineError::Contention`]: every commit attempt lost a race
    pub async fn reserve(
        &self,
        batch_id: &BatchId,
        ticket_ids: &[TicketId],
        holder_id: &HolderId,
        lease_seconds: u64,
    ) -> Result<ReserveOutcome, EngineError> {
        const OPERATION: &str = "reserve";
        let start = Instant::now();

        let result: Result<ReserveOutcome, EngineError> = async {
            validate_batch(batch_id)?;
            validate_holder(holder_id)?;
            let duration = self.lease_duration(lease_seconds)?;
            let ticket_ids = dedupe(ticket_ids)?;

            let partition = self.partitioner.partition_key(batch_id);
            let (outcome, inline_reclaims) = self
                .transact(OPERATION, &partition, &ticket_ids, |views, now| {
                    plan::reserve(views, holder_id, now, duration)
                })
                .await?;

            if inline_reclaims > 0 {
                EngineMetrics::record_inline_reclaims(inline_reclaims);
            }
            tracing::info!(
                batch = %batch_id,
                holder = %holder_id,
                reserved = outcome.reserved.len(),
                rejected = outcome.rejected.len(),
                "Reserve completed"
            );
            Ok(outcome)
        }
        .await;

        finish(OPERATION, start, &result);
        result
    }

    /// Reserve `count` arbitrary Available tickets of `batch_id`, all or nothing.
    ///
    /// # Returns
    ///
    /// [`ReserveAnyOutcome::Insufficient`] without reserving anything when the
    /// batch has fewer than `count` Available tickets.
    ///
    /// # Errors
    ///
    /// Same as [`reserve`](Self::reserve); a zero `count` is invalid.
    pub async fn reserve_any(
        &self,
        batch_id: &BatchId,
        count: usize,
        holder_id: &HolderId,
        lease_seconds: u64,
    ) -> Result<ReserveAnyOutcome, EngineError> {
        const OPERATION: &str = "reserve_any";
        let start = Instant::now();

        let result: Result<ReserveAnyOutcome, EngineError> = async {
            validate_batch(batch_id)?;
            validate_holder(holder_id)?;
            let duration = self.lease_duration(lease_seconds)?;
            if count == 0 {
                return Err(EngineError::InvalidRequest("count must be positive".to_string()));
            }

            let partition = self.partitioner.partition_key(batch_id);
            for attempt in 1..=self.config.max_commit_attempts {
                let sample = self.store.sample_available(&partition, count).await?;
                if sample.len() < count {
                    tracing::info!(
                        batch = %batch_id,
                        holder = %holder_id,
                        requested = count,
                        available = sample.len(),
                        "Not enough available tickets"
                    );
                    return Ok(ReserveAnyOutcome::Insufficient { available: sample.len() });
                }

                let views = self.store.read(&partition, &sample).await?;
                let now = self.clock.now();
                let committed = match plan::reserve_all(&views, holder_id, now, duration) {
                    Some(plan) => {
                        let Plan { writes, outcome, .. } = plan;
                        (self.store.commit(&partition, writes).await? == CommitOutcome::Committed)
                            .then_some(outcome)
                    }
                    None => None,
                };

                if let Some(reserved) = committed {
                    tracing::info!(
                        batch = %batch_id,
                        holder = %holder_id,
                        reserved = reserved.len(),
                        attempt,
                        "ReserveAny completed"
                    );
                    return Ok(ReserveAnyOutcome::Reserved(reserved));
                }

                EngineMetrics::record_conflict(OPERATION);
                tracing::debug!(batch = %batch_id, attempt, "Sample raced with another writer, redrawing");
            }

            Err(EngineError::Contention {
                attempts: self.config.max_commit_attempts,
            })
        }
        .await;

        finish(OPERATION, start, &result);
        result
    }

    /// Sell tickets of `batch_id` that `holder_id` holds under a live lease.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidRequest`]: empty ticket list or holder, or a
    ///   malformed batch id
    /// - [`EngineError::BackingStoreUnavailable`]: the store could not be reached
    /// - [`EngineError::Contention`]: every commit attempt lost a race
    pub async fn confirm(
        &self,
        batch_id: &BatchId,
        ticket_ids: &[TicketId],
        holder_id: &HolderId,
    ) -> Result<ConfirmOutcome, EngineError> {
        const OPERATION: &str = "confirm";
        let start = Instant::now();

        let result: Result<ConfirmOutcome, EngineError> = async {
            validate_batch(batch_id)?;
            validate_holder(holder_id)?;
            let ticket_ids = dedupe(ticket_ids)?;

            let partition = self.partitioner.partition_key(batch_id);
            let (outcome, _) = self
                .transact(OPERATION, &partition, &ticket_ids, |views, now| {
                    plan::confirm(views, holder_id, now)
                })
                .await?;

            tracing::info!(
                batch = %batch_id,
                holder = %holder_id,
                confirmed = outcome.confirmed.len(),
                rejected = outcome.rejected.len(),
                "Confirm completed"
            );
            Ok(outcome)
        }
        .await;

        finish(OPERATION, start, &result);
        result
    }

    /// Return tickets of `batch_id` reserved by `holder_id` to Available.
    ///
    /// # Errors
    ///
    /// Same as [`confirm`](Self::confirm).
    pub async fn rollback(
        &self,
        batch_id: &BatchId,
        ticket_ids: &[TicketId],
        holder_id: &HolderId,
    ) -> Result<RollbackOutcome, EngineError> {
        const OPERATION: &str = "rollback";
        let start = Instant::now();

        let result: Result<RollbackOutcome, EngineError> = async {
            validate_batch(batch_id)?;
            validate_holder(holder_id)?;
            let ticket_ids = dedupe(ticket_ids)?;

            let partition = self.partitioner.partition_key(batch_id);
            let (outcome, _) = self
                .transact(OPERATION, &partition, &ticket_ids, |views, now| {
                    plan::rollback(views, holder_id, now)
                })
                .await?;

            tracing::info!(
                batch = %batch_id,
                holder = %holder_id,
                released = outcome.released.len(),
                rejected = outcome.rejected.len(),
                "Rollback completed"
            );
            Ok(outcome)
        }
        .await;

        finish(OPERATION, start, &result);
        result
    }

    /// Size of each status set of `batch_id`.
    ///
    /// # Errors
    ///
    /// Returns error if the batch id is malformed or the store fails.
    pub async fn counts(&self, batch_id: &BatchId) -> Result<StatusCounts, EngineError> {
        validate_batch(batch_id)?;
        let partition = self.partitioner.partition_key(batch_id);
        Ok(self.store.counts(&partition).await?)
    }

    /// Catalog record of one ticket.
    ///
    /// # Errors
    ///
    /// Returns error if the batch id is malformed or the store fails.
    pub async fn ticket(&self, batch_id: &BatchId, ticket_id: &TicketId) -> Result<Option<Ticket>, EngineError> {
        validate_batch(batch_id)?;
        let partition = self.partitioner.partition_key(batch_id);
        Ok(self.store.ticket(&partition, ticket_id).await?)
    }

    /// Current status and lease of each ticket, without changing anything.
    ///
    /// # Errors
    ///
    /// Returns error if the batch id is malformed or the store fails.
    pub async fn inspect(&self, batch_id: &BatchId, ticket_ids: &[TicketId]) -> Result<Vec<TicketView>, EngineError> {
        validate_batch(batch_id)?;
        let partition = self.partitioner.partition_key(batch_id);
        Ok(self.store.read(&partition, ticket_ids).await?)
    }

    /// Read, plan, commit; re-plan on conflict.
    async fn transact<T, F>(
        &self,
        operation: &'static str,
        partition: &PartitionKey,
        ticket_ids: &[TicketId],
        planner: F,
    ) -> Result<(T, usize), EngineError>
    where
        F: Fn(&[TicketView], DateTime<Utc>) -> Plan<T> + Sync,
        T: Send,
    {
        for attempt in 1..=self.config.max_commit_attempts {
            let views = self.store.read(partition, ticket_ids).await?;
            let Plan { writes, outcome, inline_reclaims } = planner(&views, self.clock.now());

            if writes.is_empty() {
                return Ok((outcome, inline_reclaims));
            }

            match self.store.commit(partition, writes).await? {
                CommitOutcome::Committed => return Ok((outcome, inline_reclaims)),
                CommitOutcome::Conflict => {
                    EngineMetrics::record_conflict(operation);
                    tracing::debug!(
                        operation,
                        partition = %partition,
                        attempt,
                        "Commit conflicted, re-planning"
                    );
                }
            }
        }

        Err(EngineError::Contention {
            attempts: self.config.max_commit_attempts,
        })
    }

    fn lease_duration(&self, lease_seconds: u64) -> Result<TimeDelta, EngineError> {
        if lease_seconds == 0 {
            return Err(EngineError::InvalidRequest("lease_seconds must be positive".to_string()));
        }
        if lease_seconds > self.config.max_lease_seconds {
            return Err(EngineError::InvalidRequest(format!(
                "lease_seconds {lease_seconds} exceeds the maximum of {}",
                self.config.max_lease_seconds
            )));
        }
        i64::try_from(lease_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| EngineError::InvalidRequest(format!("lease_seconds {lease_seconds} out of range")))
    }
}

/// Outcome types that report per-ticket results.
trait Reported {
    fn transitioned(&self) -> usize;
    fn rejected(&self) -> &[Rejection];
}

impl Reported for ReserveOutcome {
    fn transitioned(&self) -> usize {
        self.reserved.len()
    }
    fn rejected(&self) -> &[Rejection] {
        &self.rejected
    }
}

impl Reported for ReserveAnyOutcome {
    fn transitioned(&self) -> usize {
        match self {
            Self::Reserved(tickets) => tickets.len(),
            Self::Insufficient { .. } => 0,
        }
    }
    fn rejected(&self) -> &[Rejection] {
        &[]
    }
}

impl Reported for ConfirmOutcome {
    fn transitioned(&self) -> usize {
        self.confirmed.len()
    }
    fn rejected(&self) -> &[Rejection] {
        &self.rejected
    }
}

impl Reported for RollbackOutcome {
    fn transitioned(&self) -> usize {
        self.released.len()
    }
    fn rejected(&self) -> &[Rejection] {
        &self.rejected
    }
}

fn finish<T: Reported>(operation: &'static str, start: Instant, result: &Result<T, EngineError>) {
    match result {
        Ok(outcome) => {
            EngineMetrics::record_call(operation, outcome.transitioned(), start.elapsed());
            for rejection in outcome.rejected() {
                EngineMetrics::record_rejection(operation, rejection.reason);
            }
        }
        Err(EngineError::Contention { attempts }) => {
            EngineMetrics::record_contention(operation);
            tracing::warn!(operation, attempts, "Gave up after repeated commit conflicts");
        }
        Err(EngineError::BackingStoreUnavailable(_) | EngineError::Store(_)) => {
            EngineMetrics::record_store_error(operation);
        }
        Err(EngineError::InvalidRequest(_)) => {}
    }
}

fn validate_batch(batch_id: &BatchId) -> Result<(), EngineError> {
    if batch_id.is_empty() {
        return Err(EngineError::InvalidRequest("batch_id must not be empty".to_string()));
    }
    if batch_id.as_str().contains(['{', '}']) {
        return Err(EngineError::InvalidRequest(format!(
            "batch_id {batch_id} must not contain braces"
        )));
    }
    Ok(())
}

fn validate_holder(holder_id: &HolderId) -> Result<(), EngineError> {
    if holder_id.is_empty() {
        return Err(EngineError::InvalidRequest("holder_id must not be empty".to_string()));
    }
    Ok(())
}

/// Drop repeated ids, keeping first occurrences in order.
fn dedupe(ticket_ids: &[TicketId]) -> Result<Vec<TicketId>, EngineError> {
    if ticket_ids.is_empty() {
        return Err(EngineError::InvalidRequest("ticket_ids must not be empty".to_string()));
    }
    let mut seen = HashSet::with_capacity(ticket_ids.len());
    Ok(ticket_ids
        .iter()
        .filter(|id| seen.insert(*id))
        .cloned()
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_keeps_first_occurrence_order() {
        let ids = [TicketId::new("b"), TicketId::new("a"), TicketId::new("b")];
        assert_eq!(dedupe(&ids), Ok(vec![TicketId::new("b"), TicketId::new("a")]));
        assert!(matches!(dedupe(&[]), Err(EngineError::InvalidRequest(_))));
    }

    #[test]
    fn batch_ids_with_hash_tag_braces_are_rejected() {
        assert!(validate_batch(&BatchId::new("90")).is_ok());
        assert!(validate_batch(&BatchId::new("")).is_err());
        assert!(validate_batch(&BatchId::new("a{b}")).is_err());
    }
}
