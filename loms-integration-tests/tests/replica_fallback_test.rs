//! Reads prefer replicas and fall back to the primary; writes never touch a
//! replica.

use std::sync::Arc;

use loms::api::{OrderInfoRequest, StocksInfoRequest};
use loms::{
    Code, Item, ItemCount, LomsApi, LomsError, OrderLifecycleService, OrderState, Sku, Stock,
    StockRepository, StockReservationEngine, UserId,
};
use loms_memory::{MemoryCluster, MemoryOrderRepository, MemoryStockRepository};
use tracing_test::traced_test;

const SKU: u32 = 2_618_151;

struct Fixture {
    cluster: MemoryCluster,
    lifecycle: OrderLifecycleService<MemoryOrderRepository, MemoryStockRepository>,
    api: LomsApi<MemoryOrderRepository, MemoryStockRepository>,
}

async fn fixture() -> Fixture {
    let cluster = MemoryCluster::with_replicas(2).expect("valid topology");
    let stocks = Arc::new(cluster.stock_repository());
    stocks
        .upsert(&[Stock::new(Sku::new(SKU), 50, 0).expect("valid")])
        .await
        .expect("seeded");
    let engine = StockReservationEngine::new(stocks);
    let lifecycle = OrderLifecycleService::new(Arc::new(cluster.order_repository()), engine.clone());
    let api = LomsApi::new(lifecycle.clone(), engine);
    Fixture {
        cluster,
        lifecycle,
        api,
    }
}

fn items(count: u32) -> Vec<Item> {
    vec![Item::new(Sku::new(SKU), ItemCount::try_new(count).expect("positive"))]
}

fn user(id: i64) -> UserId {
    UserId::try_new(id).expect("positive")
}

impl Fixture {
    fn replicas(&self) -> Vec<&loms_memory::MemoryDatabase> {
        (0..2)
            .map(|shard| {
                self.cluster
                    .replica(shard)
                    .expect("known shard")
                    .expect("has replica")
            })
            .collect()
    }
}

#[tokio::test]
async fn unreachable_replicas_do_not_block_reads() {
    let fx = fixture().await;
    let order_id = fx.lifecycle.create(user(5), items(2)).await.expect("created");

    for replica in fx.replicas() {
        replica.set_unavailable(true);
    }

    let order = fx.lifecycle.get_by_id(order_id).await.expect("read from primary");
    assert_eq!(order.state, OrderState::AwaitingPayment);
    assert_eq!(fx.lifecycle.list_all().await.expect("listed").len(), 1);

    let available = fx
        .api
        .stocks_info(StocksInfoRequest { sku: u64::from(SKU) })
        .await
        .expect("read from primary");
    assert_eq!(available.count, 48);
}

#[tokio::test]
#[traced_test]
async fn failing_replica_reads_are_retried_on_the_primary() {
    let fx = fixture().await;
    let order_id = fx.lifecycle.create(user(6), items(1)).await.expect("created");

    for replica in fx.replicas() {
        replica.set_failing(true);
    }

    let info = fx
        .api
        .order_info(OrderInfoRequest { order_id: order_id.into_inner() })
        .await
        .expect("retried on primary");
    assert_eq!(info.status, "AWAITING_PAYMENT");
    assert!(logs_contain("[router.fallback]"));
}

#[tokio::test]
async fn writes_ignore_replica_faults() {
    let fx = fixture().await;
    for replica in fx.replicas() {
        replica.set_unavailable(true);
        replica.set_failing(true);
    }

    let order_id = fx.lifecycle.create(user(8), items(3)).await.expect("created");
    fx.lifecycle.pay(order_id).await.expect("paid");

    let stock = fx
        .cluster
        .primary(0)
        .expect("shard 0")
        .stock(Sku::new(SKU))
        .await
        .expect("seeded");
    assert_eq!((stock.total_count, stock.reserved_count), (47, 0));
}

#[tokio::test]
async fn storage_outage_surfaces_as_an_internal_status() {
    let fx = fixture().await;
    let order_id = fx.lifecycle.create(user(9), items(1)).await.expect("created");
    let shard = order_id.shard().into_inner();

    fx.cluster.primary(shard).expect("known shard").set_failing(true);
    fx.cluster
        .replica(shard)
        .expect("known shard")
        .expect("has replica")
        .set_failing(true);

    let error = fx.lifecycle.get_by_id(order_id).await.unwrap_err();
    assert!(matches!(error, LomsError::Storage(_)));

    let status = fx
        .api
        .order_info(OrderInfoRequest { order_id: order_id.into_inner() })
        .await
        .unwrap_err();
    assert_eq!(status.code, Code::Internal);
    assert_eq!(status.message, loms::api::INTERNAL_ERROR_MESSAGE);
}
