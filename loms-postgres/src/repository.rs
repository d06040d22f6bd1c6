//! Stock and order repositories over the shard router.
//!
//! Inventory lives on shard 0. Orders are placed on the shard picked from the
//! user id, and every order write inserts its outbox row in the same
//! transaction.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use loms::store::{apply_adjustment, require_all_skus};
use loms::{
    Intent, Item, LomsError, NewOutboxEvent, Operation, Order, OrderId, OrderRepository,
    OrderState, ShardRouter, Sku, Stock, StockAdjustment, StockDemand, StockRepository,
    StorageError, UserId,
};
use sqlx::{query, query_as, query_scalar, Connection, PgConnection};
use tracing::{info, instrument};

use crate::rows::{group_order_rows, OrderRow, StockRow};
use crate::{map_sqlx_error, PostgresDatabase};

const SELECT_ORDER: &str = "SELECT o.id, o.user_id, o.state, i.sku, i.count
     FROM orders o
     JOIN order_items i ON i.order_id = o.id
     WHERE o.id = $1
     ORDER BY i.position";

const SELECT_ALL_ORDERS: &str = "SELECT o.id, o.user_id, o.state, i.sku, i.count
     FROM orders o
     JOIN order_items i ON i.order_id = o.id
     ORDER BY o.id DESC, i.position";

fn decode_stocks(rows: Vec<StockRow>, operation: Operation) -> Result<Vec<Stock>, StorageError> {
    rows.into_iter().map(|row| row.into_stock(operation)).collect()
}

async fn insert_outbox_event(
    connection: &mut PgConnection,
    event: &NewOutboxEvent,
) -> Result<(), StorageError> {
    query("INSERT INTO outbox (order_id, payload) VALUES ($1, $2::json)")
        .bind(event.order_id.into_inner())
        .bind(&event.payload)
        .execute(connection)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::InsertOutboxEvent))?;
    Ok(())
}

/// Inventory on shard 0.
#[derive(Debug, Clone)]
pub struct PostgresStockRepository {
    router: Arc<ShardRouter<PostgresDatabase>>,
}

impl PostgresStockRepository {
    /// Repository over `router`'s default shard.
    pub const fn new(router: Arc<ShardRouter<PostgresDatabase>>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl StockRepository for PostgresStockRepository {
    #[instrument(name = "postgres.get_stocks", skip(self))]
    async fn get_stocks(&self, skus: &[Sku]) -> Result<Vec<Stock>, LomsError> {
        let mut connection = self.router.pick_default(Intent::Read).await?;
        let keys: Vec<i64> = skus.iter().map(|sku| i64::from(sku.into_inner())).collect();

        let rows = connection
            .run(move |db| {
                let keys = keys.clone();
                Box::pin(async move {
                    query_as::<_, StockRow>(
                        "SELECT sku, total_count, reserved FROM stock WHERE sku = ANY($1)",
                    )
                    .bind(keys)
                    .fetch_all(&mut **db)
                    .await
                    .map_err(|error| map_sqlx_error(error, Operation::ReadStocks))
                })
            })
            .await?;

        let found = decode_stocks(rows, Operation::ReadStocks)?;
        require_all_skus(skus, &found)?;
        Ok(found)
    }

    #[instrument(name = "postgres.modify_stocks", skip(self, adjust))]
    async fn modify(
        &self,
        demand: &StockDemand,
        adjust: &StockAdjustment,
    ) -> Result<Vec<Stock>, LomsError> {
        let mut connection = self.router.pick_default(Intent::Write).await?;
        let mut tx = connection
            .primary_mut()
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;

        let skus = demand.skus();
        let keys: Vec<i64> = skus.iter().map(|sku| i64::from(sku.into_inner())).collect();
        let rows = query_as::<_, StockRow>(
            "SELECT sku, total_count, reserved FROM stock WHERE sku = ANY($1) ORDER BY sku FOR UPDATE",
        )
        .bind(&keys)
        .fetch_all(&mut *tx)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::ReadStocks))?;

        let locked = decode_stocks(rows, Operation::ReadStocks)?;
        require_all_skus(&skus, &locked)?;
        let updated = apply_adjustment(&locked, demand, adjust)?;

        for stock in &updated {
            query("UPDATE stock SET total_count = $1, reserved = $2 WHERE sku = $3")
                .bind(i64::from(stock.total_count))
                .bind(i64::from(stock.reserved_count))
                .bind(i64::from(stock.sku.into_inner()))
                .execute(&mut *tx)
                .await
                .map_err(|error| map_sqlx_error(error, Operation::WriteStocks))?;
        }

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;
        Ok(updated)
    }

    #[instrument(name = "postgres.upsert_stocks", skip(self, stocks), fields(rows = stocks.len()))]
    async fn upsert(&self, stocks: &[Stock]) -> Result<(), LomsError> {
        let mut connection = self.router.pick_default(Intent::Write).await?;
        let mut tx = connection
            .primary_mut()
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;

        for stock in stocks {
            query(
                "INSERT INTO stock (sku, total_count, reserved) VALUES ($1, $2, $3)
                 ON CONFLICT (sku) DO UPDATE
                 SET total_count = EXCLUDED.total_count, reserved = EXCLUDED.reserved",
            )
            .bind(i64::from(stock.sku.into_inner()))
            .bind(i64::from(stock.total_count))
            .bind(i64::from(stock.reserved_count))
            .execute(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::WriteStocks))?;
        }

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;
        Ok(())
    }
}

/// Orders sharded by user id.
#[derive(Debug, Clone)]
pub struct PostgresOrderRepository {
    router: Arc<ShardRouter<PostgresDatabase>>,
}

impl PostgresOrderRepository {
    /// Repository over every shard of `router`.
    pub const fn new(router: Arc<ShardRouter<PostgresDatabase>>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl OrderRepository for PostgresOrderRepository {
    #[instrument(name = "postgres.create_order", skip(self, items))]
    async fn create(&self, user_id: UserId, items: &[Item]) -> Result<Order, LomsError> {
        let mut connection = self.router.pick(user_id, Intent::Write).await?;
        let shard = connection.shard();
        let shard_key = i64::try_from(shard.into_inner())
            .map_err(|_| LomsError::InvalidInput(format!("shard index {shard} out of range")))?;

        let mut tx = connection
            .primary_mut()
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;

        let raw_id: i64 = query_scalar(
            "INSERT INTO orders (id, user_id, state)
             VALUES (nextval('order_id_seq') * 1000 + $1, $2, $3)
             RETURNING id",
        )
        .bind(shard_key)
        .bind(user_id.into_inner())
        .bind(OrderState::New.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::InsertOrder))?;

        let order = Order {
            id: OrderId::try_new(raw_id).map_err(|error| {
                StorageError::corrupt(Operation::InsertOrder, error.to_string())
            })?,
            user_id,
            state: OrderState::New,
            items: items.to_vec(),
        };

        for (position, item) in order.items.iter().enumerate() {
            let position = i32::try_from(position)
                .map_err(|_| LomsError::InvalidInput("too many order lines".to_owned()))?;
            query("INSERT INTO order_items (order_id, position, sku, count) VALUES ($1, $2, $3, $4)")
                .bind(raw_id)
                .bind(position)
                .bind(i64::from(item.sku.into_inner()))
                .bind(i64::from(item.count.into_inner()))
                .execute(&mut *tx)
                .await
                .map_err(|error| map_sqlx_error(error, Operation::InsertOrder))?;
        }

        insert_outbox_event(&mut tx, &NewOutboxEvent::for_order(&order)?).await?;

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;

        info!(order_id = %order.id, shard = %shard, "[postgres.create_order] order stored");
        Ok(order)
    }

    #[instrument(name = "postgres.update_order_state", skip(self, order), fields(order_id = %order.id))]
    async fn update_state(&self, order: &Order, from: OrderState) -> Result<(), LomsError> {
        let shard = self
            .router
            .shard_for_order(order.id)
            .map_err(|_| LomsError::OrderNotFound(order.id))?;
        let mut connection = self.router.pick_shard(shard, Intent::Write).await?;
        let mut tx = connection
            .primary_mut()
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;

        let updated = query(
            "UPDATE orders SET state = $1, updated_at = now() WHERE id = $2 AND state = $3",
        )
        .bind(order.state.as_str())
        .bind(order.id.into_inner())
        .bind(from.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::UpdateOrderState))?;

        if updated.rows_affected() == 0 {
            let current: Option<String> = query_scalar("SELECT state FROM orders WHERE id = $1")
                .bind(order.id.into_inner())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|error| map_sqlx_error(error, Operation::ReadOrder))?;
            return Err(match current {
                None => LomsError::OrderNotFound(order.id),
                Some(state) => LomsError::InvalidOrderState {
                    order_id: order.id,
                    from: state.parse().map_err(|_| {
                        StorageError::corrupt(Operation::ReadOrder, format!("unknown state {state}"))
                    })?,
                    to: order.state,
                },
            });
        }

        insert_outbox_event(&mut tx, &NewOutboxEvent::for_order(order)?).await?;

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;
        Ok(())
    }

    #[instrument(name = "postgres.get_order", skip(self))]
    async fn get_by_id(&self, id: OrderId, intent: Intent) -> Result<Order, LomsError> {
        let shard = self
            .router
            .shard_for_order(id)
            .map_err(|_| LomsError::OrderNotFound(id))?;
        let mut connection = self.router.pick_shard(shard, intent).await?;

        let rows = connection
            .run(move |db| {
                Box::pin(async move {
                    query_as::<_, OrderRow>(SELECT_ORDER)
                        .bind(id.into_inner())
                        .fetch_all(&mut **db)
                        .await
                        .map_err(|error| map_sqlx_error(error, Operation::ReadOrder))
                })
            })
            .await?;

        group_order_rows(rows, Operation::ReadOrder)?
            .into_iter()
            .next()
            .ok_or(LomsError::OrderNotFound(id))
    }

    #[instrument(name = "postgres.list_orders", skip(self))]
    async fn list_all(&self) -> Result<Vec<Order>, LomsError> {
        let mut connections = self.router.pick_all(Intent::Read).await?;

        let per_shard = join_all(connections.iter_mut().map(|connection| {
            connection.run(|db| {
                Box::pin(async move {
                    query_as::<_, OrderRow>(SELECT_ALL_ORDERS)
                        .fetch_all(&mut **db)
                        .await
                        .map_err(|error| map_sqlx_error(error, Operation::ListOrders))
                })
            })
        }))
        .await;

        let mut orders = Vec::new();
        for rows in per_shard {
            orders.extend(group_order_rows(rows?, Operation::ListOrders)?);
        }
        orders.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(orders)
    }
}
