//! Stock and order repositories over in-memory shards.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use loms::store::{apply_adjustment, require_all_skus};
use loms::{
    Intent, Item, LomsError, NewOutboxEvent, Operation, Order, OrderId, OrderRepository,
    OrderState, ShardRouter, Sku, Stock, StockAdjustment, StockDemand, StockRepository,
    StorageError, UserId,
};
use tracing::{debug, instrument};

use crate::database::MemoryDatabase;

/// Inventory on the default shard.
#[derive(Debug, Clone)]
pub struct MemoryStockRepository {
    router: Arc<ShardRouter<MemoryDatabase>>,
}

impl MemoryStockRepository {
    /// Repository over `router`'s default shard.
    pub const fn new(router: Arc<ShardRouter<MemoryDatabase>>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl StockRepository for MemoryStockRepository {
    #[instrument(name = "memory.get_stocks", skip(self))]
    async fn get_stocks(&self, skus: &[Sku]) -> Result<Vec<Stock>, LomsError> {
        let mut connection = self.router.pick_default(Intent::Read).await?;
        let requested = skus.to_vec();

        let found = connection
            .run(move |db| {
                let requested = requested.clone();
                Box::pin(async move {
                    let tables = db.lock(Operation::ReadStocks).await?;
                    Ok::<_, StorageError>(
                        requested
                            .iter()
                            .filter_map(|sku| tables.stock.get(sku).copied())
                            .collect::<Vec<_>>(),
                    )
                })
            })
            .await?;

        require_all_skus(skus, &found)?;
        Ok(found)
    }

    #[instrument(name = "memory.modify_stocks", skip(self, adjust))]
    async fn modify(
        &self,
        demand: &StockDemand,
        adjust: &StockAdjustment,
    ) -> Result<Vec<Stock>, LomsError> {
        let mut connection = self.router.pick_default(Intent::Write).await?;
        let mut tables = connection.primary_mut().lock(Operation::WriteStocks).await?;

        let skus = demand.skus();
        let rows: Vec<Stock> = skus
            .iter()
            .filter_map(|sku| tables.stock.get(sku).copied())
            .collect();
        require_all_skus(&skus, &rows)?;

        let updated = apply_adjustment(&rows, demand, adjust)?;
        for stock in &updated {
            tables.stock.insert(stock.sku, *stock);
        }
        Ok(updated)
    }

    #[instrument(name = "memory.upsert_stocks", skip(self, stocks), fields(rows = stocks.len()))]
    async fn upsert(&self, stocks: &[Stock]) -> Result<(), LomsError> {
        let mut connection = self.router.pick_default(Intent::Write).await?;
        let mut tables = connection.primary_mut().lock(Operation::WriteStocks).await?;
        for stock in stocks {
            tables.stock.insert(stock.sku, *stock);
        }
        Ok(())
    }
}

/// Orders sharded by user id.
#[derive(Debug, Clone)]
pub struct MemoryOrderRepository {
    router: Arc<ShardRouter<MemoryDatabase>>,
}

impl MemoryOrderRepository {
    /// Repository over every shard of `router`.
    pub const fn new(router: Arc<ShardRouter<MemoryDatabase>>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl OrderRepository for MemoryOrderRepository {
    #[instrument(name = "memory.create_order", skip(self, items))]
    async fn create(&self, user_id: UserId, items: &[Item]) -> Result<Order, LomsError> {
        let mut connection = self.router.pick(user_id, Intent::Write).await?;
        let shard = connection.shard();
        let mut tables = connection.primary_mut().lock(Operation::InsertOrder).await?;

        let sequence = tables.order_sequence + 1;
        let order = Order {
            id: OrderId::compose(sequence, shard)?,
            user_id,
            state: OrderState::New,
            items: items.to_vec(),
        };
        let event = NewOutboxEvent::for_order(&order)?;

        tables.order_sequence = sequence;
        tables.orders.insert(order.id, order.clone());
        tables.push_outbox(event);

        debug!(order_id = %order.id, shard = %shard, "[memory.create_order] order stored");
        Ok(order)
    }

    #[instrument(name = "memory.update_order_state", skip(self, order), fields(order_id = %order.id))]
    async fn update_state(&self, order: &Order, from: OrderState) -> Result<(), LomsError> {
        let shard = self
            .router
            .shard_for_order(order.id)
            .map_err(|_| LomsError::OrderNotFound(order.id))?;
        let mut connection = self.router.pick_shard(shard, Intent::Write).await?;
        let mut tables = connection.primary_mut().lock(Operation::UpdateOrderState).await?;

        let stored = tables
            .orders
            .get_mut(&order.id)
            .ok_or(LomsError::OrderNotFound(order.id))?;
        if stored.state != from {
            return Err(LomsError::InvalidOrderState {
                order_id: order.id,
                from: stored.state,
                to: order.state,
            });
        }
        stored.state = order.state;
        let event = NewOutboxEvent::for_order(stored)?;
        tables.push_outbox(event);
        Ok(())
    }

    #[instrument(name = "memory.get_order", skip(self))]
    async fn get_by_id(&self, id: OrderId, intent: Intent) -> Result<Order, LomsError> {
        let shard = self
            .router
            .shard_for_order(id)
            .map_err(|_| LomsError::OrderNotFound(id))?;
        let mut connection = self.router.pick_shard(shard, intent).await?;

        let order = connection
            .run(move |db| {
                Box::pin(async move {
                    let tables = db.lock(Operation::ReadOrder).await?;
                    Ok::<_, StorageError>(tables.orders.get(&id).cloned())
                })
            })
            .await?;

        order.ok_or(LomsError::OrderNotFound(id))
    }

    #[instrument(name = "memory.list_orders", skip(self))]
    async fn list_all(&self) -> Result<Vec<Order>, LomsError> {
        let mut connections = self.router.pick_all(Intent::Read).await?;

        let per_shard = join_all(connections.iter_mut().map(|connection| {
            connection.run(|db| {
                Box::pin(async move {
                    let tables = db.lock(Operation::ListOrders).await?;
                    Ok::<_, StorageError>(tables.orders.values().cloned().collect::<Vec<_>>())
                })
            })
        }))
        .await;

        let mut orders = Vec::new();
        for shard_orders in per_shard {
            orders.extend(shard_orders?);
        }
        orders.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(orders)
    }
}
