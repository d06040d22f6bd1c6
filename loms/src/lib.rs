//! # LOMS
//!
//! Core of a sharded order-and-inventory service: orders are created, paid
//! and cancelled while stock is reserved and released alongside them, and
//! every order change is announced downstream through a transactional outbox.
//!
//! ## Layout
//!
//! - [`sharding`]: routes user and order ids to shards, binding a replica for
//!   reads with one retry on the primary.
//! - [`store`]: repository and transaction traits implemented by the storage
//!   backends (`loms-memory`, `loms-postgres`).
//! - [`reservation`]: all-or-nothing stock reservation.
//! - [`lifecycle`]: the order state machine.
//! - [`processor`]: drains the outbox onto a [`MessagePublisher`].
//! - [`api`]: the transport-agnostic facade used by the server.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use loms::{LomsApi, OrderLifecycleService, StockReservationEngine};
//!
//! let stocks = StockReservationEngine::new(Arc::new(stock_repository));
//! let orders = OrderLifecycleService::new(Arc::new(order_repository), stocks.clone());
//! let api = LomsApi::new(orders, stocks);
//!
//! let created = api
//!     .order_create(OrderCreateRequest { user: 42, items: vec![WireItem { sku: 1076963, count: 2 }] })
//!     .await?;
//! api.order_pay(OrderPayRequest { order_id: created.order_id }).await?;
//! ```

pub mod api;
pub mod config;
pub mod errors;
pub mod lifecycle;
pub mod order;
pub mod outbox;
pub mod processor;
pub mod reservation;
pub mod seed;
pub mod sharding;
pub mod stock;
pub mod store;
pub mod types;

pub use api::{Code, LomsApi, Status};
pub use config::{
    BusConfig, BusKind, ConfigError, DatabaseConfig, LomsConfig, MaxConnections, OutboxConfig,
    PoolConfig, ShardConfig,
};
pub use errors::{ErrorKind, LomsError, LomsResult, Operation, StorageError};
pub use lifecycle::OrderLifecycleService;
pub use order::{Item, Order, OrderState};
pub use outbox::{NewOutboxEvent, OrderSnapshot, OutboxEvent, OutboxMessage};
pub use processor::{
    MessagePublisher, OutboxProcessor, PublishError, RetryingPublisher, ShardOutcome, TickReport,
};
pub use reservation::StockReservationEngine;
pub use sharding::{ConnectionSource, FallbackConnection, Intent, Shard, ShardRouter};
pub use stock::{Stock, StockDemand};
pub use store::{
    OrderRepository, OutboxTransaction, StockAdjustment, StockRepository, TransactionManager,
};
pub use types::{ItemCount, OrderId, OutboxEventId, ShardIndex, Sku, UserId};
