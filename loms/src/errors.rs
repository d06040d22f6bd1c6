//! Error types for LOMS.
//!
//! Two layers, mirroring where a failure originates:
//!
//! - **LomsError**: domain failures the caller can act on (missing stock,
//!   illegal state transition, bad input) plus a wrapped storage failure.
//! - **StorageError**: infrastructure failures tagged with the [`Operation`]
//!   that was running when they happened.
//!
//! Callers that only need a coarse decision use [`LomsError::kind`].

use thiserror::Error;

use crate::order::OrderState;
use crate::types::{OrderId, Sku};

/// Result alias used throughout the crate.
pub type LomsResult<T> = Result<T, LomsError>;

/// Domain-level failure.
#[derive(Debug, Error)]
pub enum LomsError {
    /// No order with the given id exists on its shard.
    #[error("order {0} not found")]
    OrderNotFound(OrderId),

    /// No stock row exists for the SKU.
    #[error("stock for sku {0} not found")]
    StockNotFound(Sku),

    /// Fewer units are available than requested.
    #[error("insufficient stock for sku {sku}: requested {requested}, available {available}")]
    InsufficientStock {
        /// SKU that ran short.
        sku: Sku,
        /// Units requested by the call.
        requested: u32,
        /// Units that were available.
        available: u32,
    },

    /// Releasing or consuming more units than are reserved.
    #[error("reserved count for sku {sku} would become negative: reserved {reserved}, requested {requested}")]
    NegativeReserved {
        /// SKU whose reservation is too small.
        sku: Sku,
        /// Units currently reserved.
        reserved: u32,
        /// Units the call tried to release.
        requested: u32,
    },

    /// Stored reservation exceeds stored total.
    #[error("available count for sku {sku} is negative: total {total}, reserved {reserved}")]
    NegativeAvailable {
        /// Affected SKU.
        sku: Sku,
        /// Stored total units.
        total: u32,
        /// Stored reserved units.
        reserved: u32,
    },

    /// The order is not in a state that permits the requested transition.
    #[error("order {order_id} cannot move from {from} to {to}")]
    InvalidOrderState {
        /// Order the transition was attempted on.
        order_id: OrderId,
        /// State the transition started from.
        from: OrderState,
        /// Requested target state.
        to: OrderState,
    },

    /// Malformed request data.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Infrastructure failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// An order snapshot could not be encoded or decoded.
    #[error("order snapshot serialization failed")]
    Serialization(#[source] serde_json::Error),

    /// The message bus rejected an outbox message.
    #[error(transparent)]
    Publish(#[from] crate::processor::PublishError),
}

/// Coarse classification of a [`LomsError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Not enough units to satisfy the request.
    InsufficientStock,
    /// Order or stock row missing.
    NotFound,
    /// Illegal lifecycle transition.
    InvalidOrderState,
    /// Counts would become negative.
    NegativeCount,
    /// Malformed request.
    InvalidInput,
    /// Storage, serialization or bus failure.
    Internal,
}

impl LomsError {
    /// Classifies the error for transport mapping and retry decisions.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InsufficientStock { .. } => ErrorKind::InsufficientStock,
            Self::OrderNotFound(_) | Self::StockNotFound(_) => ErrorKind::NotFound,
            Self::InvalidOrderState { .. } => ErrorKind::InvalidOrderState,
            Self::NegativeReserved { .. } | Self::NegativeAvailable { .. } => {
                ErrorKind::NegativeCount
            }
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Storage(_) | Self::Serialization(_) | Self::Publish(_) => ErrorKind::Internal,
        }
    }
}

/// Storage operations, used to tag [`StorageError`]s in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Acquiring a pooled connection.
    Acquire,
    /// Beginning a database transaction.
    BeginTransaction,
    /// Committing a database transaction.
    CommitTransaction,
    /// Reading stock rows.
    ReadStocks,
    /// Writing stock rows.
    WriteStocks,
    /// Inserting an order and its items.
    InsertOrder,
    /// Conditionally updating an order's state.
    UpdateOrderState,
    /// Reading a single order.
    ReadOrder,
    /// Reading every order on a shard.
    ListOrders,
    /// Writing an outbox event.
    InsertOutboxEvent,
    /// Reading pending outbox events.
    ReadOutbox,
    /// Marking an outbox event as processed.
    MarkProcessed,
    /// Applying schema migrations.
    Migrate,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Acquire => write!(f, "acquire"),
            Self::BeginTransaction => write!(f, "begin_transaction"),
            Self::CommitTransaction => write!(f, "commit_transaction"),
            Self::ReadStocks => write!(f, "read_stocks"),
            Self::WriteStocks => write!(f, "write_stocks"),
            Self::InsertOrder => write!(f, "insert_order"),
            Self::UpdateOrderState => write!(f, "update_order_state"),
            Self::ReadOrder => write!(f, "read_order"),
            Self::ListOrders => write!(f, "list_orders"),
            Self::InsertOutboxEvent => write!(f, "insert_outbox_event"),
            Self::ReadOutbox => write!(f, "read_outbox"),
            Self::MarkProcessed => write!(f, "mark_processed"),
            Self::Migrate => write!(f, "migrate"),
        }
    }
}

/// Infrastructure failure raised by a storage backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A shard index outside the router's range.
    #[error("unknown shard {index}; router holds {shard_count} shards")]
    UnknownShard {
        /// Requested index.
        index: usize,
        /// Number of configured shards.
        shard_count: usize,
    },

    /// A router was built with an unusable shard list.
    #[error("invalid shard topology: {0}")]
    InvalidTopology(String),

    /// The backend reported a failure while running `operation`.
    #[error("storage operation {operation} failed: {detail}")]
    Failure {
        /// Operation in flight.
        operation: Operation,
        /// Backend-specific description.
        detail: String,
    },

    /// A row could not be decoded into a domain value.
    #[error("corrupt row during {operation}: {detail}")]
    Corrupt {
        /// Operation in flight.
        operation: Operation,
        /// What was wrong with the row.
        detail: String,
    },
}

impl StorageError {
    /// Shorthand for [`StorageError::Failure`].
    pub fn failure(operation: Operation, detail: impl Into<String>) -> Self {
        Self::Failure {
            operation,
            detail: detail.into(),
        }
    }

    /// Shorthand for [`StorageError::Corrupt`].
    pub fn corrupt(operation: Operation, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            operation,
            detail: detail.into(),
        }
    }
}
