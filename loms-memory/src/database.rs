//! A mutex-guarded in-memory database standing in for one physical server.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use loms::{
    ConnectionSource, NewOutboxEvent, Operation, Order, OrderId, OutboxEvent, OutboxEventId, Sku,
    Stock, StorageError,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Everything one database stores.
#[derive(Debug, Default)]
pub struct Tables {
    pub(crate) orders: BTreeMap<OrderId, Order>,
    pub(crate) order_sequence: i64,
    pub(crate) stock: BTreeMap<Sku, Stock>,
    pub(crate) outbox: Vec<OutboxEvent>,
    pub(crate) outbox_sequence: i64,
}

impl Tables {
    /// Appends an unprocessed outbox row.
    pub(crate) fn push_outbox(&mut self, event: NewOutboxEvent) {
        self.outbox_sequence += 1;
        self.outbox.push(OutboxEvent {
            id: OutboxEventId::new(self.outbox_sequence),
            order_id: event.order_id,
            payload: event.payload,
            created_at: Utc::now(),
            processed: false,
        });
    }
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: AtomicBool,
    failing: AtomicBool,
}

/// One in-memory database.
///
/// Clones share tables and fault switches. A [`replica`](Self::replica)
/// shares tables only, so replication is instantaneous while faults can be
/// injected on either side independently.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<Faults>,
}

impl MemoryDatabase {
    /// Empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// A replica of this database with its own fault switches.
    pub fn replica(&self) -> Self {
        Self {
            tables: Arc::clone(&self.tables),
            faults: Arc::new(Faults::default()),
        }
    }

    /// When set, acquiring a connection fails.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// When set, every operation on an acquired connection fails.
    pub fn set_failing(&self, failing: bool) {
        self.faults.failing.store(failing, Ordering::SeqCst);
    }

    /// Copy of every outbox row, oldest first.
    pub async fn outbox_events(&self) -> Vec<OutboxEvent> {
        self.tables.lock().await.outbox.clone()
    }

    /// Copy of a stored order.
    pub async fn order(&self, id: OrderId) -> Option<Order> {
        self.tables.lock().await.orders.get(&id).cloned()
    }

    /// Copy of a stock row.
    pub async fn stock(&self, sku: Sku) -> Option<Stock> {
        self.tables.lock().await.stock.get(&sku).copied()
    }
}

/// Connection to a [`MemoryDatabase`].
#[derive(Debug)]
pub struct MemoryConnection {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<Faults>,
}

impl MemoryConnection {
    /// Locks the database for one unit of work.
    pub(crate) async fn lock(
        &self,
        operation: Operation,
    ) -> Result<OwnedMutexGuard<Tables>, StorageError> {
        if self.faults.failing.load(Ordering::SeqCst) {
            return Err(StorageError::failure(operation, "injected failure"));
        }
        Ok(Arc::clone(&self.tables).lock_owned().await)
    }
}

#[async_trait]
impl ConnectionSource for MemoryDatabase {
    type Connection = MemoryConnection;

    async fn acquire(&self) -> Result<MemoryConnection, StorageError> {
        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::failure(Operation::Acquire, "database unavailable"));
        }
        Ok(MemoryConnection {
            tables: Arc::clone(&self.tables),
            faults: Arc::clone(&self.faults),
        })
    }
}
