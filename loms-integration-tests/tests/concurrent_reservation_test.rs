//! Reservations racing for the same SKUs on a multi-threaded runtime.
//!
//! However the requests interleave, every successful reservation is counted
//! exactly once and the reserved units never exceed what is in stock.

use std::sync::Arc;

use loms::{Item, ItemCount, LomsError, Sku, Stock, StockRepository, StockReservationEngine};
use loms_memory::{MemoryCluster, MemoryStockRepository};

const WIDGETS: u32 = 1_625_903;
const GADGETS: u32 = 2_956_315;

async fn engine(
    cluster: &MemoryCluster,
    stock: &[(u32, u32)],
) -> StockReservationEngine<MemoryStockRepository> {
    let stocks = Arc::new(cluster.stock_repository());
    let rows: Vec<Stock> = stock
        .iter()
        .map(|&(sku, total)| Stock::new(Sku::new(sku), total, 0).expect("valid"))
        .collect();
    stocks.upsert(&rows).await.expect("seeded");
    StockReservationEngine::new(stocks)
}

fn item(sku: u32, count: u32) -> Item {
    Item::new(Sku::new(sku), ItemCount::try_new(count).expect("positive"))
}

async fn stock(cluster: &MemoryCluster, sku: u32) -> Stock {
    cluster
        .primary(0)
        .expect("shard 0")
        .stock(Sku::new(sku))
        .await
        .expect("seeded")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_reservations_never_oversell() {
    let cluster = MemoryCluster::new(2).expect("valid topology");
    let engine = engine(&cluster, &[(WIDGETS, 50)]).await;

    let handles: Vec<_> = (0..40u32)
        .map(|request| {
            let engine = engine.clone();
            let count = request % 7 + 1;
            tokio::spawn(async move {
                let result = engine.reserve(&[item(WIDGETS, count)]).await;
                (count, result)
            })
        })
        .collect();

    let mut granted = 0;
    for handle in handles {
        match handle.await.expect("task did not panic") {
            (count, Ok(())) => granted += count,
            (_, Err(error)) => assert!(
                matches!(error, LomsError::InsufficientStock { .. }),
                "unexpected failure: {error}"
            ),
        }
    }

    let widgets = stock(&cluster, WIDGETS).await;
    assert_eq!(widgets.reserved_count, granted);
    assert!(widgets.reserved_count <= widgets.total_count);
    assert_eq!(widgets.total_count, 50);
    assert!(granted > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_multi_sku_reservations_stay_all_or_nothing() {
    let cluster = MemoryCluster::new(3).expect("valid topology");
    let engine = engine(&cluster, &[(WIDGETS, 30), (GADGETS, 20)]).await;

    let handles: Vec<_> = (0..24u32)
        .map(|request| {
            let engine = engine.clone();
            let count = request % 4 + 1;
            tokio::spawn(async move {
                let items = [item(WIDGETS, count), item(GADGETS, count)];
                engine.reserve(&items).await.map(|()| count)
            })
        })
        .collect();

    let mut granted = 0;
    for handle in handles {
        if let Ok(count) = handle.await.expect("task did not panic") {
            granted += count;
        }
    }

    let widgets = stock(&cluster, WIDGETS).await;
    let gadgets = stock(&cluster, GADGETS).await;
    assert_eq!(widgets.reserved_count, granted);
    assert_eq!(gadgets.reserved_count, granted);
    assert!(gadgets.reserved_count <= gadgets.total_count);
    assert_eq!(engine.available(Sku::new(WIDGETS)).await.expect("known"), 30 - granted);
}
