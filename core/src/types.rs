//! Domain types for ticket leasing.
//!
//! This module contains the identifiers and records shared by every Leasehold
//! crate: tickets as provisioned in the catalog, the three-way status partition,
//! and reservation leases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[doc = concat!("Creates a `", stringify!($name), "` from any string-like value")]
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the identifier as a string slice
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns `true` if the identifier is the empty string
            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identifier of a ticket batch (all tickets sharing one partition key)
    BatchId
);

string_id!(
    /// Identifier of a single ticket, unique within its batch
    TicketId
);

string_id!(
    /// Opaque client or session token owning a reservation
    HolderId
);

/// Unique identifier of one reservation lease.
///
/// A fresh `LeaseId` is minted every time a ticket enters Reserved, so two
/// leases on the same ticket are never confused even if they share a holder
/// and an expiry instant. Expiry reclamation compares lease ids, not ticket ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(Uuid);

impl LeaseId {
    /// Creates a new random `LeaseId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `LeaseId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// A provisioned ticket.
///
/// Written once into the catalog and never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    /// Ticket identity
    pub ticket_id: TicketId,
    /// Batch the ticket belongs to
    pub batch_id: BatchId,
    /// Venue / seat descriptor (e.g. "Section A, Row 3, Seat 12")
    #[serde(default)]
    pub descriptor: String,
    /// Arbitrary immutable metadata
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Ticket {
    /// Create a ticket with an empty metadata blob.
    #[must_use]
    pub fn new(
        ticket_id: impl Into<TicketId>,
        batch_id: impl Into<BatchId>,
        descriptor: impl Into<String>,
    ) -> Self {
        Self {
            ticket_id: ticket_id.into(),
            batch_id: batch_id.into(),
            descriptor: descriptor.into(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Attach a metadata blob.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

// ============================================================================
// Status Partition
// ============================================================================

/// The status set a ticket currently belongs to.
///
/// Every provisioned ticket is a member of exactly one of these sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    /// Free to reserve
    Available,
    /// Held by a live or not-yet-reclaimed lease
    Reserved,
    /// Confirmed; terminal
    Sold,
}

impl TicketStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 3] = [Self::Available, Self::Reserved, Self::Sold];

    /// Name of the membership set backing this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Reserved => "reserved",
            Self::Sold => "sold",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Leases
// ============================================================================

/// A reservation lease on one ticket.
///
/// Exists if and only if the ticket is in the Reserved set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Leased ticket
    pub ticket_id: TicketId,
    /// Version of this lease
    pub lease_id: LeaseId,
    /// Owner of the reservation
    pub holder_id: HolderId,
    /// Absolute deadline
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Returns `true` while the deadline has not been reached.
    ///
    /// A lease whose `expires_at` equals `now` is already expired, matching the
    /// `score <= now` range used by the lease index.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// Returns `true` if `holder` owns this lease.
    #[must_use]
    pub fn is_held_by(&self, holder: &HolderId) -> bool {
        &self.holder_id == holder
    }

    /// Lease index score (unix milliseconds of the deadline).
    #[must_use]
    pub fn expiry_score(&self) -> i64 {
        self.expires_at.timestamp_millis()
    }
}
