//! Order lifecycle service.
//!
//! Drives orders through the state machine in [`crate::order`] and keeps
//! inventory in step through the [`StockReservationEngine`]. Order and stock
//! live on different shards, so a conditional state update that loses a race
//! after the stock change has committed leaves the stock change in place.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::errors::LomsError;
use crate::order::{Item, Order, OrderState};
use crate::reservation::StockReservationEngine;
use crate::sharding::Intent;
use crate::store::{OrderRepository, StockRepository};
use crate::types::{OrderId, UserId};

/// Creates, pays, cancels and looks up orders.
#[derive(Debug)]
pub struct OrderLifecycleService<O, S> {
    orders: Arc<O>,
    stocks: StockReservationEngine<S>,
}

impl<O, S> Clone for OrderLifecycleService<O, S> {
    fn clone(&self) -> Self {
        Self {
            orders: Arc::clone(&self.orders),
            stocks: self.stocks.clone(),
        }
    }
}

impl<O: OrderRepository, S: StockRepository> OrderLifecycleService<O, S> {
    /// Wires the service to its repositories.
    pub const fn new(orders: Arc<O>, stocks: StockReservationEngine<S>) -> Self {
        Self { orders, stocks }
    }

    /// Persists a new order and reserves its stock.
    ///
    /// The order is stored as `NEW` first. A successful reservation moves it to
    /// `AWAITING_PAYMENT`; a failed one moves it to `FAILED` and the
    /// reservation error is returned. Either way the order row remains.
    #[instrument(name = "lifecycle.create", skip(self, items), fields(user_id = %user_id))]
    pub async fn create(&self, user_id: UserId, items: Vec<Item>) -> Result<OrderId, LomsError> {
        if items.is_empty() {
            return Err(LomsError::InvalidInput(
                "order must contain at least one item".to_owned(),
            ));
        }

        let mut order = self.orders.create(user_id, &items).await?;
        info!(order_id = %order.id, "[lifecycle.create] order persisted");

        match self.stocks.reserve(&order.items).await {
            Ok(()) => {
                let previous = order.transition(OrderState::AwaitingPayment)?;
                self.orders.update_state(&order, previous).await?;
                info!(order_id = %order.id, "[lifecycle.create] order awaiting payment");
                Ok(order.id)
            }
            Err(reservation_error) => {
                warn!(
                    order_id = %order.id,
                    error = %reservation_error,
                    "[lifecycle.create] reservation failed, marking order failed"
                );
                let previous = order.transition(OrderState::Failed)?;
                self.orders.update_state(&order, previous).await?;
                Err(reservation_error)
            }
        }
    }

    /// Consumes the order's reserved stock and marks it paid.
    #[instrument(name = "lifecycle.pay", skip(self), fields(order_id = %order_id))]
    pub async fn pay(&self, order_id: OrderId) -> Result<(), LomsError> {
        let mut order = self.orders.get_by_id(order_id, Intent::Write).await?;
        let previous = order.transition(OrderState::Payed)?;

        self.stocks.reserve_remove(&order.items).await?;
        self.orders.update_state(&order, previous).await?;

        info!("[lifecycle.pay] order paid");
        Ok(())
    }

    /// Releases the order's reserved stock and marks it cancelled.
    #[instrument(name = "lifecycle.cancel", skip(self), fields(order_id = %order_id))]
    pub async fn cancel(&self, order_id: OrderId) -> Result<(), LomsError> {
        let mut order = self.orders.get_by_id(order_id, Intent::Write).await?;
        let previous = order.transition(OrderState::Cancelled)?;

        self.stocks.reserve_cancel(&order.items).await?;
        self.orders.update_state(&order, previous).await?;

        info!("[lifecycle.cancel] order cancelled");
        Ok(())
    }

    /// Loads an order, preferring a replica.
    #[instrument(name = "lifecycle.get_by_id", skip(self))]
    pub async fn get_by_id(&self, order_id: OrderId) -> Result<Order, LomsError> {
        self.orders.get_by_id(order_id, Intent::Read).await
    }

    /// Every order across all shards, newest id first.
    #[instrument(name = "lifecycle.list_all", skip(self))]
    pub async fn list_all(&self) -> Result<Vec<Order>, LomsError> {
        self.orders.list_all().await
    }
}
