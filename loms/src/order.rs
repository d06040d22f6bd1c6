//! Orders and their lifecycle state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::LomsError;
use crate::types::{ItemCount, OrderId, Sku, UserId};

/// Lifecycle state of an order.
///
/// ```text
/// NEW ──► AWAITING_PAYMENT ──► PAYED
///  │            │
///  │            ├──────────► CANCELLED
///  ▼            ▼
/// FAILED ◄──────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    /// Persisted, stock not yet reserved.
    New,
    /// Stock reserved, waiting for payment.
    AwaitingPayment,
    /// Paid; reserved stock consumed.
    Payed,
    /// Cancelled; reserved stock released.
    Cancelled,
    /// Reservation failed.
    Failed,
}

impl OrderState {
    /// Whether the state machine permits moving from `self` to `next`.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::AwaitingPayment | Self::Failed)
                | (Self::AwaitingPayment, Self::Payed | Self::Cancelled | Self::Failed)
        )
    }

    /// States with no outgoing transitions.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Payed | Self::Cancelled | Self::Failed)
    }

    /// Wire and storage representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::AwaitingPayment => "AWAITING_PAYMENT",
            Self::Payed => "PAYED",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderState {
    type Err = LomsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "NEW" => Ok(Self::New),
            "AWAITING_PAYMENT" => Ok(Self::AwaitingPayment),
            "PAYED" => Ok(Self::Payed),
            "CANCELLED" => Ok(Self::Cancelled),
            "FAILED" => Ok(Self::Failed),
            other => Err(LomsError::InvalidInput(format!("unknown order state {other:?}"))),
        }
    }
}

/// One order line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Ordered SKU.
    pub sku: Sku,
    /// Units of the SKU.
    pub count: ItemCount,
}

impl Item {
    /// Creates an order line.
    pub const fn new(sku: Sku, count: ItemCount) -> Self {
        Self { sku, count }
    }
}

/// A persisted order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Shard-encoded identifier.
    pub id: OrderId,
    /// Customer that placed the order.
    pub user_id: UserId,
    /// Current lifecycle state.
    pub state: OrderState,
    /// Order lines in submission order.
    pub items: Vec<Item>,
}

impl Order {
    /// Moves the in-memory order to `next`, returning the state it left.
    ///
    /// Storage is untouched; the returned state is the precondition for the
    /// conditional update that persists the change.
    pub fn transition(&mut self, next: OrderState) -> Result<OrderState, LomsError> {
        if !self.state.can_transition_to(next) {
            return Err(LomsError::InvalidOrderState {
                order_id: self.id,
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }
}
