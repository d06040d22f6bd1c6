//! In-memory backend for LOMS
//!
//! Implements the storage traits from the `loms` crate over mutex-guarded
//! in-memory databases, one per shard member, plus an in-memory message bus.
//! Useful for tests and local development where persistence is not required.
//! Replicas share their primary's tables and carry their own fault switches
//! so fallback paths can be exercised.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

mod database;
mod publisher;
mod repository;
mod transaction;

use std::sync::Arc;

use loms::{Shard, ShardIndex, ShardRouter, StorageError};

pub use database::{MemoryConnection, MemoryDatabase, Tables};
pub use publisher::InMemoryPublisher;
pub use repository::{MemoryOrderRepository, MemoryStockRepository};
pub use transaction::{MemoryTransaction, MemoryTransactionManager};

/// A set of in-memory shards behind one router.
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    router: Arc<ShardRouter<MemoryDatabase>>,
}

impl MemoryCluster {
    /// `shard_count` shards without replicas.
    pub fn new(shard_count: usize) -> Result<Self, StorageError> {
        Self::build(shard_count, false)
    }

    /// `shard_count` shards, each with a replica.
    pub fn with_replicas(shard_count: usize) -> Result<Self, StorageError> {
        Self::build(shard_count, true)
    }

    fn build(shard_count: usize, replicas: bool) -> Result<Self, StorageError> {
        let shards = (0..shard_count)
            .map(|_| {
                let primary = MemoryDatabase::new();
                if replicas {
                    let replica = primary.replica();
                    Shard::with_replica(primary, replica)
                } else {
                    Shard::new(primary)
                }
            })
            .collect();
        Ok(Self {
            router: Arc::new(ShardRouter::new(shards)?),
        })
    }

    /// The shared router.
    pub fn router(&self) -> Arc<ShardRouter<MemoryDatabase>> {
        Arc::clone(&self.router)
    }

    /// Primary database of `shard`.
    pub fn primary(&self, shard: usize) -> Result<&MemoryDatabase, StorageError> {
        self.router
            .shard(ShardIndex::new(shard))
            .map(Shard::primary)
    }

    /// Replica database of `shard`, if it has one.
    pub fn replica(&self, shard: usize) -> Result<Option<&MemoryDatabase>, StorageError> {
        self.router
            .shard(ShardIndex::new(shard))
            .map(Shard::replica)
    }

    /// Stock repository on the default shard.
    pub fn stock_repository(&self) -> MemoryStockRepository {
        MemoryStockRepository::new(self.router())
    }

    /// Order repository over every shard.
    pub fn order_repository(&self) -> MemoryOrderRepository {
        MemoryOrderRepository::new(self.router())
    }

    /// Transaction manager over every shard.
    pub fn transaction_manager(&self) -> MemoryTransactionManager {
        MemoryTransactionManager::new(self.router())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loms::{
        Intent, Item, ItemCount, LomsError, OrderRepository, OrderState, OutboxConfig,
        OutboxProcessor, OutboxTransaction, Sku, Stock, StockDemand, StockRepository,
        TransactionManager, UserId,
    };
    use std::time::Duration;

    fn item(sku: u32, count: u32) -> Item {
        Item::new(Sku::new(sku), ItemCount::try_new(count).expect("positive"))
    }

    fn user(id: i64) -> UserId {
        UserId::try_new(id).expect("positive")
    }

    fn outbox_config(batch_size: usize) -> OutboxConfig {
        OutboxConfig {
            interval: Duration::from_millis(10),
            batch_size,
            topic: "loms.order-events".to_owned(),
        }
    }

    #[tokio::test]
    async fn created_order_lands_on_the_users_shard_with_an_outbox_event() {
        let cluster = MemoryCluster::new(3).expect("valid topology");
        let orders = cluster.order_repository();
        let expected_shard = cluster.router().shard_for_user(user(42));

        let order = orders.create(user(42), &[item(1, 2)]).await.expect("stored");

        assert_eq!(order.state, OrderState::New);
        assert_eq!(order.id.shard(), expected_shard);
        let database = cluster.primary(expected_shard.into_inner()).expect("exists");
        let events = database.outbox_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].order_id, order.id);
        assert!(events[0].payload.contains("\"State\":\"NEW\""));
    }

    #[tokio::test]
    async fn order_ids_are_sequential_per_shard() {
        let cluster = MemoryCluster::new(1).expect("valid topology");
        let orders = cluster.order_repository();

        let first = orders.create(user(1), &[item(1, 1)]).await.expect("stored");
        let second = orders.create(user(2), &[item(1, 1)]).await.expect("stored");

        assert_eq!(first.id.into_inner(), 1000);
        assert_eq!(second.id.into_inner(), 2000);
    }

    #[tokio::test]
    async fn conditional_update_rejects_a_stale_precondition() {
        let cluster = MemoryCluster::new(2).expect("valid topology");
        let orders = cluster.order_repository();
        let mut order = orders.create(user(7), &[item(1, 1)]).await.expect("stored");

        order.state = OrderState::AwaitingPayment;
        orders.update_state(&order, OrderState::New).await.expect("fresh");

        order.state = OrderState::Failed;
        let error = orders.update_state(&order, OrderState::New).await.unwrap_err();
        assert!(matches!(
            error,
            LomsError::InvalidOrderState {
                from: OrderState::AwaitingPayment,
                to: OrderState::Failed,
                ..
            }
        ));

        let stored = orders.get_by_id(order.id, Intent::Write).await.expect("exists");
        assert_eq!(stored.state, OrderState::AwaitingPayment);
    }

    #[tokio::test]
    async fn order_on_unknown_shard_is_not_found() {
        let cluster = MemoryCluster::new(2).expect("valid topology");
        let orders = cluster.order_repository();
        let id = loms::OrderId::try_new(1_005).expect("positive");

        assert!(matches!(
            orders.get_by_id(id, Intent::Read).await,
            Err(LomsError::OrderNotFound(_))
        ));
    }

    #[tokio::test]
    async fn failing_replica_read_is_served_by_primary() {
        let cluster = MemoryCluster::with_replicas(1).expect("valid topology");
        let orders = cluster.order_repository();
        let order = orders.create(user(3), &[item(1, 1)]).await.expect("stored");

        cluster.replica(0).expect("exists").expect("configured").set_failing(true);

        let loaded = orders.get_by_id(order.id, Intent::Read).await.expect("fallback");
        assert_eq!(loaded, order);
    }

    #[tokio::test]
    async fn failing_primary_surfaces_storage_error() {
        let cluster = MemoryCluster::with_replicas(1).expect("valid topology");
        let orders = cluster.order_repository();
        let order = orders.create(user(3), &[item(1, 1)]).await.expect("stored");

        cluster.replica(0).expect("exists").expect("configured").set_failing(true);
        cluster.primary(0).expect("exists").set_failing(true);

        let error = orders.get_by_id(order.id, Intent::Read).await.unwrap_err();
        assert!(matches!(error, LomsError::Storage(_)));
    }

    #[tokio::test]
    async fn list_all_merges_shards_newest_first() {
        let cluster = MemoryCluster::new(4).expect("valid topology");
        let orders = cluster.order_repository();
        for id in 1..=10 {
            orders.create(user(id), &[item(1, 1)]).await.expect("stored");
        }

        let listed = orders.list_all().await.expect("listed");

        assert_eq!(listed.len(), 10);
        assert!(listed.windows(2).all(|pair| pair[0].id > pair[1].id));
    }

    #[tokio::test]
    async fn stock_modify_is_atomic_across_skus() {
        let cluster = MemoryCluster::new(2).expect("valid topology");
        let stocks = cluster.stock_repository();
        stocks
            .upsert(&[
                Stock::new(Sku::new(1), 10, 0).expect("valid"),
                Stock::new(Sku::new(2), 1, 0).expect("valid"),
            ])
            .await
            .expect("seeded");

        let demand = StockDemand::from_items(&[item(1, 5), item(2, 5)]).expect("fits");
        let result = stocks
            .modify(&demand, &loms::reservation::reserve_units)
            .await;

        assert!(matches!(result, Err(LomsError::InsufficientStock { .. })));
        let database = cluster.primary(0).expect("exists");
        assert_eq!(database.stock(Sku::new(1)).await.map(|s| s.reserved_count), Some(0));
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_events_pending() {
        let cluster = MemoryCluster::new(1).expect("valid topology");
        let orders = cluster.order_repository();
        let manager = cluster.transaction_manager();
        orders.create(user(1), &[item(1, 1)]).await.expect("stored");

        {
            let mut transaction = manager.begin(ShardIndex::new(0)).await.expect("begun");
            let pending = transaction.pending_events(10).await.expect("read");
            transaction.mark_processed(pending[0].id).await.expect("marked");
        }

        let mut transaction = manager.begin(ShardIndex::new(0)).await.expect("begun");
        let pending = transaction.pending_events(10).await.expect("read");
        assert_eq!(pending.len(), 1);
        transaction.mark_processed(pending[0].id).await.expect("marked");
        transaction.commit().await.expect("committed");

        let mut transaction = manager.begin(ShardIndex::new(0)).await.expect("begun");
        assert!(transaction.pending_events(10).await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn processor_publishes_pending_events_in_batches() {
        let cluster = MemoryCluster::new(1).expect("valid topology");
        let orders = cluster.order_repository();
        for id in 1..=3 {
            orders.create(user(id), &[item(1, 1)]).await.expect("stored");
        }
        let publisher = Arc::new(InMemoryPublisher::new());
        let processor = OutboxProcessor::new(
            Arc::new(cluster.transaction_manager()),
            Arc::clone(&publisher),
            outbox_config(2),
        );

        let first = processor.tick().await.expect("began");
        let second = processor.tick().await.expect("began");
        let third = processor.tick().await.expect("began");

        assert_eq!((first.published(), second.published(), third.published()), (2, 1, 0));
        let keys: Vec<String> = publisher.messages().into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["1000", "2000", "3000"]);
    }

    #[tokio::test]
    async fn publish_failure_rolls_back_the_shard_batch() {
        let cluster = MemoryCluster::new(1).expect("valid topology");
        let orders = cluster.order_repository();
        orders.create(user(1), &[item(1, 1)]).await.expect("stored");
        let publisher = Arc::new(InMemoryPublisher::new());
        let processor = OutboxProcessor::new(
            Arc::new(cluster.transaction_manager()),
            Arc::clone(&publisher),
            outbox_config(10),
        );

        publisher.set_failing(true);
        let report = processor.tick().await.expect("began");
        assert!(!report.is_clean());
        assert_eq!(report.published(), 0);

        publisher.set_failing(false);
        let report = processor.tick().await.expect("began");
        assert_eq!(report.published(), 1);
        let events = cluster.primary(0).expect("exists").outbox_events().await;
        assert!(events.iter().all(|event| event.processed));
    }
}
