//! Storage capability traits.
//!
//! Backends (`loms-memory`, `loms-postgres`) implement these over a
//! [`ShardRouter`](crate::sharding::ShardRouter); services are generic over
//! them and never see connections or SQL. Repositories enforce no business
//! rules beyond the atomicity each method promises.

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::LomsError;
use crate::order::{Item, Order, OrderState};
use crate::outbox::OutboxEvent;
use crate::sharding::Intent;
use crate::stock::{Stock, StockDemand};
use crate::types::{OrderId, OutboxEventId, ShardIndex, Sku, UserId};

/// Per-row adjustment applied by [`StockRepository::modify`].
///
/// Receives the locked row and the aggregated count requested for its SKU.
pub type StockAdjustment = dyn Fn(&mut Stock, u32) -> Result<(), LomsError> + Send + Sync;

/// Inventory access. Inventory lives on the default shard.
#[async_trait]
pub trait StockRepository: Send + Sync {
    /// Reads the rows for `skus` with read intent.
    ///
    /// Fails with [`LomsError::StockNotFound`] for the first missing SKU.
    async fn get_stocks(&self, skus: &[Sku]) -> Result<Vec<Stock>, LomsError>;

    /// Locks every SKU in `demand`, applies `adjust` to each and writes the
    /// results back, all inside one transaction on the primary.
    ///
    /// If any SKU is missing or any adjustment fails nothing is written.
    async fn modify(
        &self,
        demand: &StockDemand,
        adjust: &StockAdjustment,
    ) -> Result<Vec<Stock>, LomsError>;

    /// Inserts or replaces stock rows. Used for bulk loading.
    async fn upsert(&self, stocks: &[Stock]) -> Result<(), LomsError>;
}

/// Order access. Each write also records an outbox event in the same
/// transaction on the order's shard.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Persists a new order in [`OrderState::New`] on `user_id`'s shard and
    /// returns it with its allocated id.
    async fn create(&self, user_id: UserId, items: &[Item]) -> Result<Order, LomsError>;

    /// Persists `order.state`, provided the stored state still equals `from`.
    ///
    /// Fails with [`LomsError::InvalidOrderState`] when another writer moved
    /// the order first, or [`LomsError::OrderNotFound`] when it does not exist.
    async fn update_state(&self, order: &Order, from: OrderState) -> Result<(), LomsError>;

    /// Loads an order from its shard.
    async fn get_by_id(&self, id: OrderId, intent: Intent) -> Result<Order, LomsError>;

    /// Every order on every shard, newest id first.
    async fn list_all(&self) -> Result<Vec<Order>, LomsError>;
}

/// Opens transactions used by the outbox processor.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Transaction handle; rolls back when dropped without [`commit`](OutboxTransaction::commit).
    type Transaction: OutboxTransaction;

    /// Begins a transaction on the primary of `shard`.
    async fn begin(&self, shard: ShardIndex) -> Result<Self::Transaction, LomsError>;

    /// Begins one transaction per shard, in shard order.
    async fn begin_all(&self) -> Result<Vec<Self::Transaction>, LomsError>;
}

/// Outbox operations available inside a shard transaction.
#[async_trait]
pub trait OutboxTransaction: Send + Sized {
    /// Shard this transaction runs on.
    fn shard(&self) -> ShardIndex;

    /// Up to `limit` unprocessed events, oldest first, locked for this
    /// transaction.
    async fn pending_events(&mut self, limit: usize) -> Result<Vec<OutboxEvent>, LomsError>;

    /// Flags an event as published.
    async fn mark_processed(&mut self, id: OutboxEventId) -> Result<(), LomsError>;

    /// Makes every change in the transaction durable.
    async fn commit(self) -> Result<(), LomsError>;
}

#[async_trait]
impl<T: StockRepository + ?Sized> StockRepository for Arc<T> {
    async fn get_stocks(&self, skus: &[Sku]) -> Result<Vec<Stock>, LomsError> {
        (**self).get_stocks(skus).await
    }

    async fn modify(
        &self,
        demand: &StockDemand,
        adjust: &StockAdjustment,
    ) -> Result<Vec<Stock>, LomsError> {
        (**self).modify(demand, adjust).await
    }

    async fn upsert(&self, stocks: &[Stock]) -> Result<(), LomsError> {
        (**self).upsert(stocks).await
    }
}

#[async_trait]
impl<T: OrderRepository + ?Sized> OrderRepository for Arc<T> {
    async fn create(&self, user_id: UserId, items: &[Item]) -> Result<Order, LomsError> {
        (**self).create(user_id, items).await
    }

    async fn update_state(&self, order: &Order, from: OrderState) -> Result<(), LomsError> {
        (**self).update_state(order, from).await
    }

    async fn get_by_id(&self, id: OrderId, intent: Intent) -> Result<Order, LomsError> {
        (**self).get_by_id(id, intent).await
    }

    async fn list_all(&self) -> Result<Vec<Order>, LomsError> {
        (**self).list_all().await
    }
}

/// Checks that every requested SKU came back from storage.
///
/// Backends call this after their lookup so a missing SKU surfaces as
/// [`LomsError::StockNotFound`] regardless of how rows were fetched.
pub fn require_all_skus(requested: &[Sku], found: &[Stock]) -> Result<(), LomsError> {
    match requested
        .iter()
        .find(|sku| !found.iter().any(|stock| stock.sku == **sku))
    {
        Some(missing) => Err(LomsError::StockNotFound(*missing)),
        None => Ok(()),
    }
}

/// Applies `adjust` to every row named by `demand`, in SKU order.
///
/// `rows` must already contain every demanded SKU. Returns the adjusted
/// copies; the originals are left untouched so a failure can be discarded.
pub fn apply_adjustment(
    rows: &[Stock],
    demand: &StockDemand,
    adjust: &StockAdjustment,
) -> Result<Vec<Stock>, LomsError> {
    demand
        .iter()
        .map(|(sku, count)| {
            let mut stock = *rows
                .iter()
                .find(|row| row.sku == sku)
                .ok_or(LomsError::StockNotFound(sku))?;
            adjust(&mut stock, count)?;
            Ok(stock)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stock(sku: u32, total: u32, reserved: u32) -> Stock {
        Stock::new(Sku::new(sku), total, reserved).expect("valid stock")
    }

    #[test]
    fn missing_sku_is_reported() {
        let found = vec![stock(1, 10, 0)];
        let result = require_all_skus(&[Sku::new(1), Sku::new(2)], &found);
        assert!(matches!(result, Err(LomsError::StockNotFound(sku)) if sku == Sku::new(2)));
    }

    #[test]
    fn adjustment_failure_discards_every_row() {
        let rows = vec![stock(1, 10, 0), stock(2, 1, 0)];
        let demand = StockDemand::from_items(&[
            Item::new(Sku::new(1), crate::types::ItemCount::try_new(3).expect("positive")),
            Item::new(Sku::new(2), crate::types::ItemCount::try_new(3).expect("positive")),
        ])
        .expect("fits");
        let adjust: &StockAdjustment = &|stock, count| {
            if stock.total_count < count {
                return Err(LomsError::InvalidInput("short".to_owned()));
            }
            stock.reserved_count += count;
            Ok(())
        };

        assert!(apply_adjustment(&rows, &demand, adjust).is_err());
        assert_eq!(rows[0].reserved_count, 0);
    }
}
