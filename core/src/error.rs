//! Error types for the backing store and the transition engine.
//!
//! Only infrastructure faults and malformed requests are errors. Per-ticket
//! business outcomes (`NotAvailable`, `WrongHolder`, ...) are reported through
//! [`crate::outcome`] instead.

use thiserror::Error;

/// Errors raised by a [`TicketStore`](crate::store::TicketStore) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or refused the request (transient).
    #[error("Backing store unavailable: {0}")]
    Unavailable(String),

    /// A record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The store returned data that violates the storage layout.
    #[error("Corrupt store data: {0}")]
    Corrupt(String),
}

/// Errors that abort an entire engine call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The request is malformed (empty ticket list, zero lease, foreign batch, ...).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Transient infrastructure failure; nothing was applied.
    ///
    /// The engine never retries this itself. Callers may re-issue the request.
    #[error("Backing store unavailable: {0}")]
    BackingStoreUnavailable(String),

    /// The optimistic commit lost to concurrent writers on every attempt.
    ///
    /// Unlike per-ticket rejections this aborts the whole call, like
    /// [`BackingStoreUnavailable`](Self::BackingStoreUnavailable). Nothing was
    /// written, so the caller may re-issue the request.
    #[error("Gave up after {attempts} conflicting commit attempts")]
    Contention {
        /// Number of commit attempts made
        attempts: usize,
    },

    /// Non-transient store failure.
    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => Self::BackingStoreUnavailable(msg),
            other => Self::Store(other),
        }
    }
}

impl EngineError {
    /// Returns `true` if re-issuing the same request may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::BackingStoreUnavailable(_) | Self::Contention { .. })
    }
}
