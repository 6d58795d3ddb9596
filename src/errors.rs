//! Unified error type for the contract ledger.
//!
//! Business-rule rejections carry the figures the caller needs to explain the
//! failure to a user. Driver errors are classified on conversion so the retry
//! helper can tell a transient write conflict from a timeout or a hard failure.

use rust_decimal::Decimal;
use sea_orm::{ConnAcquireErr, DbErr};
use thiserror::Error;

/// One rejected line of a multi-line reservation request.
#[derive(Debug)]
pub struct RejectedItem {
    /// Contract line item the caller asked to reserve against
    pub contract_line_item_id: i64,
    /// Why this line could not be reserved
    pub reason: Error,
}

/// Every failure the ledger can surface.
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown contract, line item or additive.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record that was looked up
        entity: &'static str,
        /// Identifier that was not found
        id: String,
    },

    /// A movement was appended against a line item that does not exist.
    #[error("Unknown contract line item: {line_item_id}")]
    UnknownLineItem {
        /// The missing line item id
        line_item_id: i64,
    },

    /// A line item id that does not belong to the additive's contract.
    #[error("Line item {line_item_id} does not belong to contract {contract_id}")]
    LineItemNotFound {
        /// The offending line item id
        line_item_id: i64,
        /// Contract the additive belongs to
        contract_id: i64,
    },

    /// The request is larger than the line's available quantity.
    #[error(
        "Insufficient balance on line item {line_item_id}: available {available}, requested {requested}"
    )]
    InsufficientBalance {
        /// Line item that lacks balance
        line_item_id: i64,
        /// Quantity still available
        available: Decimal,
        /// Quantity that was requested
        requested: Decimal,
    },

    /// The line has nothing left to reserve or consume.
    #[error("Line item {line_item_id} is exhausted")]
    LineExhausted {
        /// Line item with no remaining quantity
        line_item_id: i64,
    },

    /// Active percentage additives would exceed the legal accumulation cap.
    #[error(
        "Legal cap of {cap}% exceeded: accumulated {accumulated}%, available {available}%"
    )]
    LegalCapExceeded {
        /// Accumulated percentage including the candidate
        accumulated: Decimal,
        /// Percentage still available before the candidate
        available: Decimal,
        /// Configured cap
        cap: Decimal,
    },

    /// Aggregated per-line rejections of a reservation; nothing was committed.
    #[error("Reservation for {reference_document} rejected on {} line(s)", .rejections.len())]
    ReservationRejected {
        /// Correlation key of the order
        reference_document: String,
        /// One entry per failing line
        rejections: Vec<RejectedItem>,
    },

    /// A quantity or price that must be positive was not.
    #[error("Invalid quantity: {quantity}")]
    InvalidQuantity {
        /// The rejected quantity
        quantity: Decimal,
    },

    /// A percentage that is not positive or does not suit the additive kind.
    #[error("Invalid percentage: {percentage}")]
    InvalidPercentage {
        /// The rejected percentage
        percentage: Decimal,
    },

    /// The additive cannot move line item quantities in its current state.
    #[error("Additive {additive_id} cannot be applied: {reason}")]
    AdditiveNotApplicable {
        /// The additive that was asked to move quantities
        additive_id: i64,
        /// What disqualifies it
        reason: String,
    },

    /// The additive already holds line item rows; revert it first.
    #[error("Additive {additive_id} is already applied")]
    AdditiveAlreadyApplied {
        /// The additive that already has line item rows
        additive_id: i64,
    },

    /// Transient write-write conflict reported by the store. Retried locally.
    #[error("Serialization conflict: {message}")]
    SerializationConflict {
        /// Driver message
        message: String,
    },

    /// Every retry attempt hit a write conflict.
    #[error("Concurrent update: gave up after {attempts} attempt(s)")]
    ConcurrentUpdate {
        /// Number of attempts made
        attempts: u32,
    },

    /// Pool acquisition or statement timeout. Never retried by this crate.
    #[error("Database timeout: {message}")]
    Timeout {
        /// Driver message
        message: String,
    },

    /// Missing or invalid configuration.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the problem
        message: String,
    },

    /// Any other driver or ORM failure.
    #[error("Database error: {0}")]
    Database(DbErr),
}

impl Error {
    /// Whether the retry helper should run the operation again.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::SerializationConflict { .. })
    }

    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

const CONFLICT_MARKERS: &[&str] = &[
    "database is locked",
    "database table is locked",
    "could not serialize access",
    "deadlock detected",
    "lock wait timeout exceeded",
    "deadlock found",
];

const TIMEOUT_MARKERS: &[&str] = &["statement timeout", "canceling statement due to"];

impl From<DbErr> for Error {
    fn from(err: DbErr) -> Self {
        if let DbErr::ConnectionAcquire(ConnAcquireErr::Timeout) = err {
            return Self::Timeout {
                message: err.to_string(),
            };
        }

        let message = err.to_string();
        let lowered = message.to_lowercase();
        if TIMEOUT_MARKERS.iter().any(|m| lowered.contains(m)) {
            Self::Timeout { message }
        } else if CONFLICT_MARKERS.iter().any(|m| lowered.contains(m)) {
            Self::SerializationConflict { message }
        } else {
            Self::Database(err)
        }
    }
}

// Convenience `Result` type
pub type Result<T> = std::result::Result<T, Error>;
