//! Redis-backed [`TicketStore`].
//!
//! # Layout
//!
//! Every key of a batch shares the batch's hash tag, so a whole batch lives in
//! one Redis Cluster slot and a single Lua script may touch all of it:
//!
//! - `{ns}:{tag}:available|reserved|sold` (Set) → ticket ids per status
//! - `{ns}:{tag}:tickets` (Hash) → ticket id → JSON catalog record
//! - `{ns}:{tag}:leases` (Hash) → ticket id → JSON lease record
//! - `{ns}:{tag}:lease_exp` (Sorted Set) → ticket id scored by lease deadline (ms)
//! - `{ns}:batches` (Set) → every provisioned batch id, outside any batch slot
//!
//! # Atomicity
//!
//! Reads use `MULTI`/`EXEC` pipelines, so one read sees one point in time.
//! Commits run a Lua script that checks every precondition before applying any
//! mutation; Redis runs scripts without interleaving other commands.
//!
//! Requires Redis 6.2 or later (`SMISMEMBER`).

use chrono::{DateTime, Utc};
use leasehold_core::outcome::StatusCounts;
use leasehold_core::partition::{PartitionKey, Partitioner};
use leasehold_core::store::{
    CommitOutcome, IndexEntry, Mutation, Precondition, TicketStore, TicketView, WriteSet,
};
use leasehold_core::types::{BatchId, Lease, Ticket, TicketId, TicketStatus};
use leasehold_core::StoreError;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, ErrorKind, RedisError, Script};

const TICKETS: &str = "tickets";
const LEASES: &str = "leases";
const LEASE_INDEX: &str = "lease_exp";

/// Tickets written per provisioning script call.
const PROVISION_CHUNK: usize = 500;

/// KEYS: tickets, available. ARGV: ticket id / JSON pairs.
const PROVISION_SCRIPT: &str = r"
    local added = 0
    for i = 1, #ARGV, 2 do
        if redis.call('HSETNX', KEYS[1], ARGV[i], ARGV[i + 1]) == 1 then
            redis.call('SADD', KEYS[2], ARGV[i])
            added = added + 1
        end
    end
    return added
";

/// KEYS: available, reserved, sold, leases, lease_exp.
/// ARGV: precondition count, then (kind, ticket, expected) triples,
/// then mutation count, then (op, ticket, a, b) quadruples.
const COMMIT_SCRIPT: &str = r"
    local sets = { available = KEYS[1], reserved = KEYS[2], sold = KEYS[3] }
    local leases = KEYS[4]
    local index = KEYS[5]

    local i = 2
    for _ = 1, tonumber(ARGV[1]) do
        local kind, ticket, expected = ARGV[i], ARGV[i + 1], ARGV[i + 2]
        i = i + 3
        if kind == 'status' then
            if redis.call('SISMEMBER', sets[expected], ticket) == 0 then
                return 0
            end
        else
            local raw = redis.call('HGET', leases, ticket)
            if expected == '' then
                if raw then
                    return 0
                end
            elseif not raw or cjson.decode(raw)['lease_id'] ~= expected then
                return 0
            end
        end
    end

    local count = tonumber(ARGV[i])
    i = i + 1
    for _ = 1, count do
        local op, ticket, a, b = ARGV[i], ARGV[i + 1], ARGV[i + 2], ARGV[i + 3]
        i = i + 4
        if op == 'move' then
            redis.call('SMOVE', sets[a], sets[b], ticket)
        elseif op == 'put_lease' then
            redis.call('HSET', leases, ticket, a)
        elseif op == 'delete_lease' then
            redis.call('HDEL', leases, ticket)
        elseif op == 'index_insert' then
            redis.call('ZADD', index, a, ticket)
        elseif op == 'index_remove' then
            redis.call('ZREM', index, ticket)
        end
    end
    return 1
";

/// Ticket store backed by a single Redis deployment (standalone or cluster-compatible layout).
///
/// Cheap to clone; clones share one multiplexed connection.
#[derive(Clone)]
pub struct RedisTicketStore {
    /// Connection manager for connection pooling.
    conn_manager: ConnectionManager,
    registry_key: String,
    provision_script: Script,
    commit_script: Script,
}

impl RedisTicketStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `partitioner` - The partitioner the engine uses, for the batch registry key
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the URL is invalid or Redis cannot be reached.
    pub async fn new(redis_url: &str, partitioner: &Partitioner) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(|e| {
            StoreError::Unavailable(format!("Failed to create Redis client: {e}"))
        })?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            StoreError::Unavailable(format!("Failed to create Redis connection manager: {e}"))
        })?;

        Ok(Self::from_manager(conn_manager, partitioner))
    }

    /// Wrap an existing connection manager.
    #[must_use]
    pub fn from_manager(conn_manager: ConnectionManager, partitioner: &Partitioner) -> Self {
        Self {
            conn_manager,
            registry_key: partitioner.registry_key(),
            provision_script: Script::new(PROVISION_SCRIPT),
            commit_script: Script::new(COMMIT_SCRIPT),
        }
    }
}

fn store_error(context: &str, err: &RedisError) -> StoreError {
    if err.kind() == ErrorKind::TypeError {
        StoreError::Corrupt(format!("{context}: {err}"))
    } else {
        StoreError::Unavailable(format!("{context}: {err}"))
    }
}

fn status_from_membership(
    ticket_id: &TicketId,
    available: bool,
    reserved: bool,
    sold: bool,
) -> Result<Option<TicketStatus>, StoreError> {
    match (available, reserved, sold) {
        (false, false, false) => Ok(None),
        (true, false, false) => Ok(Some(TicketStatus::Available)),
        (false, true, false) => Ok(Some(TicketStatus::Reserved)),
        (false, false, true) => Ok(Some(TicketStatus::Sold)),
        _ => Err(StoreError::Corrupt(format!(
            "ticket {ticket_id} is a member of more than one status set"
        ))),
    }
}

/// Flatten one mutation into the script's `(op, ticket, a, b)` argument form.
fn encode_mutation(mutation: &Mutation) -> Result<[String; 4], StoreError> {
    Ok(match mutation {
        Mutation::Move { ticket_id, from, to } => [
            "move".to_string(),
            ticket_id.to_string(),
            from.as_str().to_string(),
            to.as_str().to_string(),
        ],
        Mutation::PutLease(lease) => [
            "put_lease".to_string(),
            lease.ticket_id.to_string(),
            serde_json::to_string(lease).map_err(|e| StoreError::Serialization(e.to_string()))?,
            String::new(),
        ],
        Mutation::DeleteLease(ticket_id) => {
            ["delete_lease".to_string(), ticket_id.to_string(), String::new(), String::new()]
        }
        Mutation::IndexInsert { ticket_id, score } => [
            "index_insert".to_string(),
            ticket_id.to_string(),
            score.to_string(),
            String::new(),
        ],
        Mutation::IndexRemove(ticket_id) => {
            ["index_remove".to_string(), ticket_id.to_string(), String::new(), String::new()]
        }
    })
}

impl TicketStore for RedisTicketStore {
    async fn provision(&self, partition: &PartitionKey, tickets: &[Ticket]) -> Result<usize, StoreError> {
        let mut conn = self.conn_manager.clone();
        let mut added = 0;

        for chunk in tickets.chunks(PROVISION_CHUNK) {
            let mut invocation = self.provision_script.prepare_invoke();
            invocation
                .key(partition.key(TICKETS))
                .key(partition.key(TicketStatus::Available.as_str()));
            for ticket in chunk {
                let json = serde_json::to_string(ticket)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                invocation.arg(ticket.ticket_id.as_str()).arg(json);
            }

            let chunk_added: usize = invocation
                .invoke_async(&mut conn)
                .await
                .map_err(|e| store_error("Failed to provision tickets", &e))?;
            added += chunk_added;
        }

        // The registry lives in another slot, so it cannot join the script
        let _: () = conn
            .sadd(&self.registry_key, partition.batch_id().as_str())
            .await
            .map_err(|e| store_error("Failed to register batch", &e))?;

        tracing::debug!(partition = %partition, added, "Provisioned tickets in Redis");
        Ok(added)
    }

    async fn read(&self, partition: &PartitionKey, ticket_ids: &[TicketId]) -> Result<Vec<TicketView>, StoreError> {
        if ticket_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn_manager.clone();
        let ids: Vec<&str> = ticket_ids.iter().map(TicketId::as_str).collect();

        let (available, reserved, sold, leases): (Vec<bool>, Vec<bool>, Vec<bool>, Vec<Option<String>>) =
            redis::pipe()
                .atomic()
                .cmd("SMISMEMBER")
                .arg(partition.key(TicketStatus::Available.as_str()))
                .arg(&ids)
                .cmd("SMISMEMBER")
                .arg(partition.key(TicketStatus::Reserved.as_str()))
                .arg(&ids)
                .cmd("SMISMEMBER")
                .arg(partition.key(TicketStatus::Sold.as_str()))
                .arg(&ids)
                .cmd("HMGET")
                .arg(partition.key(LEASES))
                .arg(&ids)
                .query_async(&mut conn)
                .await
                .map_err(|e| store_error("Failed to read tickets", &e))?;

        let expected = ticket_ids.len();
        if [available.len(), reserved.len(), sold.len(), leases.len()] != [expected; 4] {
            return Err(StoreError::Corrupt(format!(
                "snapshot of {expected} tickets returned mismatched replies"
            )));
        }

        ticket_ids
            .iter()
            .zip(available)
            .zip(reserved)
            .zip(sold)
            .zip(leases)
            .map(|((((ticket_id, a), r), s), raw_lease)| {
                let status = status_from_membership(ticket_id, a, r, s)?;
                let lease = raw_lease
                    .map(|raw| serde_json::from_str::<Lease>(&raw))
                    .transpose()
                    .map_err(|e| StoreError::Serialization(format!("lease of {ticket_id}: {e}")))?;
                Ok(TicketView {
                    ticket_id: ticket_id.clone(),
                    status,
                    lease,
                })
            })
            .collect()
    }

    async fn expired(
        &self,
        partition: &PartitionKey,
        now: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<IndexEntry>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn_manager.clone();
        let start = isize::try_from(offset).unwrap_or(isize::MAX);
        let count = isize::try_from(limit).unwrap_or(isize::MAX);
        let entries: Vec<(String, f64)> = conn
            .zrangebyscore_limit_withscores(
                partition.key(LEASE_INDEX),
                "-inf",
                now.timestamp_millis(),
                start,
                count,
            )
            .await
            .map_err(|e| store_error("Failed to scan lease index", &e))?;

        // Millisecond scores are integral and well within f64's exact range
        #[allow(clippy::cast_possible_truncation)]
        let entries = entries
            .into_iter()
            .map(|(ticket_id, score)| IndexEntry {
                ticket_id: TicketId::new(ticket_id),
                score: score as i64,
            })
            .collect();
        Ok(entries)
    }

    async fn sample_available(&self, partition: &PartitionKey, count: usize) -> Result<Vec<TicketId>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn_manager.clone();
        let ids: Vec<String> = conn
            .srandmember_multiple(partition.key(TicketStatus::Available.as_str()), count)
            .await
            .map_err(|e| store_error("Failed to sample available tickets", &e))?;

        Ok(ids.into_iter().map(TicketId::new).collect())
    }

    async fn commit(&self, partition: &PartitionKey, writes: WriteSet) -> Result<CommitOutcome, StoreError> {
        let mut conn = self.conn_manager.clone();
        let mut invocation = self.commit_script.prepare_invoke();
        for suffix in [
            TicketStatus::Available.as_str(),
            TicketStatus::Reserved.as_str(),
            TicketStatus::Sold.as_str(),
            LEASES,
            LEASE_INDEX,
        ] {
            invocation.key(partition.key(suffix));
        }

        invocation.arg(writes.preconditions.len());
        for precondition in &writes.preconditions {
            match precondition {
                Precondition::Status { ticket_id, expected } => {
                    invocation.arg("status").arg(ticket_id.as_str()).arg(expected.as_str());
                }
                Precondition::Lease { ticket_id, expected } => {
                    let expected = expected.map(|id| id.to_string()).unwrap_or_default();
                    invocation.arg("lease").arg(ticket_id.as_str()).arg(expected);
                }
            }
        }

        invocation.arg(writes.mutations.len());
        for mutation in &writes.mutations {
            for part in encode_mutation(mutation)? {
                invocation.arg(part);
            }
        }

        let applied: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("Failed to commit write set", &e))?;

        Ok(if applied == 1 {
            CommitOutcome::Committed
        } else {
            CommitOutcome::Conflict
        })
    }

    async fn ticket(&self, partition: &PartitionKey, ticket_id: &TicketId) -> Result<Option<Ticket>, StoreError> {
        let mut conn = self.conn_manager.clone();
        let raw: Option<String> = conn
            .hget(partition.key(TICKETS), ticket_id.as_str())
            .await
            .map_err(|e| store_error("Failed to read ticket", &e))?;

        raw.map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|e| StoreError::Serialization(format!("ticket {ticket_id}: {e}")))
    }

    async fn counts(&self, partition: &PartitionKey) -> Result<StatusCounts, StoreError> {
        let mut conn = self.conn_manager.clone();
        let (available, reserved, sold): (usize, usize, usize) = redis::pipe()
            .atomic()
            .scard(partition.key(TicketStatus::Available.as_str()))
            .scard(partition.key(TicketStatus::Reserved.as_str()))
            .scard(partition.key(TicketStatus::Sold.as_str()))
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("Failed to count tickets", &e))?;

        Ok(StatusCounts { available, reserved, sold })
    }

    async fn batches(&self) -> Result<Vec<BatchId>, StoreError> {
        let mut conn = self.conn_manager.clone();
        let mut members: Vec<String> = conn
            .smembers(&self.registry_key)
            .await
            .map_err(|e| store_error("Failed to list batches", &e))?;
        members.sort();

        Ok(members.into_iter().map(BatchId::new).collect())
    }
}
