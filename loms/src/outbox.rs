//! Transactional outbox records.
//!
//! Every order mutation writes a [`NewOutboxEvent`] carrying the order's
//! post-mutation [`OrderSnapshot`] in the same transaction. The processor
//! later reads them back as [`OutboxEvent`]s and turns each into an
//! [`OutboxMessage`] for the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::LomsError;
use crate::order::{Order, OrderState};
use crate::types::{OrderId, OutboxEventId};

/// JSON shape consumed by the notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    /// Order id.
    #[serde(rename = "ID")]
    pub id: i64,
    /// Customer id.
    #[serde(rename = "UserId")]
    pub user_id: i64,
    /// State after the mutation.
    #[serde(rename = "State")]
    pub state: OrderState,
    /// Order lines.
    #[serde(rename = "Items")]
    pub items: Vec<SnapshotItem>,
}

/// Order line inside an [`OrderSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotItem {
    /// SKU.
    #[serde(rename = "SKU")]
    pub sku: u32,
    /// Units.
    #[serde(rename = "Count")]
    pub count: u32,
}

impl From<&Order> for OrderSnapshot {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id.into_inner(),
            user_id: order.user_id.into_inner(),
            state: order.state,
            items: order
                .items
                .iter()
                .map(|item| SnapshotItem {
                    sku: item.sku.into_inner(),
                    count: item.count.into_inner(),
                })
                .collect(),
        }
    }
}

/// Outbox row about to be inserted alongside an order mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboxEvent {
    /// Order the event documents.
    pub order_id: OrderId,
    /// Serialized [`OrderSnapshot`].
    pub payload: String,
}

impl NewOutboxEvent {
    /// Snapshots `order` as it is now.
    pub fn for_order(order: &Order) -> Result<Self, LomsError> {
        let payload =
            serde_json::to_string(&OrderSnapshot::from(order)).map_err(LomsError::Serialization)?;
        Ok(Self {
            order_id: order.id,
            payload,
        })
    }
}

/// Persisted outbox row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEvent {
    /// Row id.
    pub id: OutboxEventId,
    /// Order the event documents.
    pub order_id: OrderId,
    /// Serialized [`OrderSnapshot`].
    pub payload: String,
    /// Insertion time; orders delivery within a shard.
    pub created_at: DateTime<Utc>,
    /// Set once the event has been published.
    pub processed: bool,
}

impl OutboxEvent {
    /// Decodes the payload.
    pub fn snapshot(&self) -> Result<OrderSnapshot, LomsError> {
        serde_json::from_str(&self.payload).map_err(LomsError::Serialization)
    }
}

/// A message ready for the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    /// Destination topic.
    pub topic: String,
    /// Partitioning key: the decimal order id.
    pub key: String,
    /// Raw payload bytes.
    pub value: Vec<u8>,
    /// Event creation time.
    pub timestamp: DateTime<Utc>,
}

impl OutboxMessage {
    /// Builds the bus message for `event`.
    pub fn from_event(topic: &str, event: &OutboxEvent) -> Self {
        Self {
            topic: topic.to_owned(),
            key: event.order_id.to_string(),
            value: event.payload.clone().into_bytes(),
            timestamp: event.created_at,
        }
    }
}
