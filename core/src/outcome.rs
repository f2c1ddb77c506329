//! Structured results of engine operations.
//!
//! A batch call that partially succeeds is normal output: accepted tickets and
//! rejected tickets are both reported here. Only infrastructure faults surface
//! as [`EngineError`](crate::error::EngineError).

use crate::types::{LeaseId, TicketId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a single ticket was not transitioned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    /// Ticket is reserved by a live lease or already sold.
    NotAvailable,
    /// Ticket is reserved by a different holder.
    WrongHolder,
    /// Ticket has already been sold.
    AlreadySold,
    /// Ticket holds no reservation the caller could release.
    NotReserved,
    /// The caller's lease is past its deadline (or has been reclaimed).
    LeaseExpired,
    /// Ticket id is not in the batch's catalog.
    UnknownTicket,
}

impl RejectReason {
    /// Stable label, used for metrics and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotAvailable => "not_available",
            Self::WrongHolder => "wrong_holder",
            Self::AlreadySold => "already_sold",
            Self::NotReserved => "not_reserved",
            Self::LeaseExpired => "lease_expired",
            Self::UnknownTicket => "unknown_ticket",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ticket that was not transitioned, with the reason.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Rejected ticket
    pub ticket_id: TicketId,
    /// Why it was rejected
    pub reason: RejectReason,
}

impl Rejection {
    /// Create a rejection.
    #[must_use]
    pub const fn new(ticket_id: TicketId, reason: RejectReason) -> Self {
        Self { ticket_id, reason }
    }
}

/// A ticket now held by the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedTicket {
    /// Reserved ticket
    pub ticket_id: TicketId,
    /// Lease now protecting the reservation
    pub lease_id: LeaseId,
    /// Deadline for confirmation
    pub expires_at: DateTime<Utc>,
}

/// Result of `Reserve`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveOutcome {
    /// Tickets held by the caller after the call, in request order
    pub reserved: Vec<ReservedTicket>,
    /// Tickets that could not be reserved
    pub rejected: Vec<Rejection>,
}

impl ReserveOutcome {
    /// Ids of the reserved tickets.
    #[must_use]
    pub fn reserved_ids(&self) -> Vec<TicketId> {
        self.reserved.iter().map(|r| r.ticket_id.clone()).collect()
    }

    /// Rejection reason for `ticket_id`, if it was rejected.
    #[must_use]
    pub fn rejection_for(&self, ticket_id: &TicketId) -> Option<RejectReason> {
        find_reason(&self.rejected, ticket_id)
    }
}

/// Result of `ReserveAny`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReserveAnyOutcome {
    /// Exactly the requested number of tickets were reserved.
    Reserved(Vec<ReservedTicket>),
    /// Fewer tickets than requested were available; nothing was reserved.
    Insufficient {
        /// Available tickets observed at the time of the call
        available: usize,
    },
}

/// Result of `Confirm`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmOutcome {
    /// Tickets moved to Sold
    pub confirmed: Vec<TicketId>,
    /// Tickets that could not be confirmed
    pub rejected: Vec<Rejection>,
}

impl ConfirmOutcome {
    /// Rejection reason for `ticket_id`, if it was rejected.
    #[must_use]
    pub fn rejection_for(&self, ticket_id: &TicketId) -> Option<RejectReason> {
        find_reason(&self.rejected, ticket_id)
    }
}

/// Result of `Rollback`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    /// Tickets returned to Available
    pub released: Vec<TicketId>,
    /// Tickets that could not be released
    pub rejected: Vec<Rejection>,
}

impl RollbackOutcome {
    /// Rejection reason for `ticket_id`, if it was rejected.
    #[must_use]
    pub fn rejection_for(&self, ticket_id: &TicketId) -> Option<RejectReason> {
        find_reason(&self.rejected, ticket_id)
    }
}

/// Size of each status set of a batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    /// Tickets in Available
    pub available: usize,
    /// Tickets in Reserved
    pub reserved: usize,
    /// Tickets in Sold
    pub sold: usize,
}

impl StatusCounts {
    /// Total provisioned tickets.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.available + self.reserved + self.sold
    }
}

fn find_reason(rejected: &[Rejection], ticket_id: &TicketId) -> Option<RejectReason> {
    rejected
        .iter()
        .find(|r| &r.ticket_id == ticket_id)
        .map(|r| r.reason)
}
