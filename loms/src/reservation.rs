//! Stock reservation engine.
//!
//! Reserve, consume and release inventory for a set of order lines. Each call
//! aggregates its lines by SKU and hands a single adjustment to
//! [`StockRepository::modify`], so either every SKU changes or none does.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::errors::LomsError;
use crate::order::Item;
use crate::stock::{Stock, StockDemand};
use crate::store::{StockAdjustment, StockRepository};
use crate::types::Sku;

/// Reserves `count` more units.
pub fn reserve_units(stock: &mut Stock, count: u32) -> Result<(), LomsError> {
    let available = stock.available()?;
    if available < count {
        return Err(LomsError::InsufficientStock {
            sku: stock.sku,
            requested: count,
            available,
        });
    }
    stock.reserved_count += count;
    Ok(())
}

/// Consumes `count` reserved units: both reserved and total shrink.
pub fn remove_reserved_units(stock: &mut Stock, count: u32) -> Result<(), LomsError> {
    if stock.reserved_count < count {
        return Err(LomsError::NegativeReserved {
            sku: stock.sku,
            reserved: stock.reserved_count,
            requested: count,
        });
    }
    if stock.total_count < count {
        return Err(LomsError::InsufficientStock {
            sku: stock.sku,
            requested: count,
            available: stock.total_count,
        });
    }
    stock.reserved_count -= count;
    stock.total_count -= count;
    Ok(())
}

/// Releases `count` reserved units back to the available pool.
pub fn cancel_reserved_units(stock: &mut Stock, count: u32) -> Result<(), LomsError> {
    if stock.reserved_count < count {
        return Err(LomsError::NegativeReserved {
            sku: stock.sku,
            reserved: stock.reserved_count,
            requested: count,
        });
    }
    stock.reserved_count -= count;
    Ok(())
}

/// All-or-nothing inventory operations over a [`StockRepository`].
#[derive(Debug)]
pub struct StockReservationEngine<S> {
    stocks: Arc<S>,
}

impl<S> Clone for StockReservationEngine<S> {
    fn clone(&self) -> Self {
        Self {
            stocks: Arc::clone(&self.stocks),
        }
    }
}

impl<S: StockRepository> StockReservationEngine<S> {
    /// Creates an engine over `stocks`.
    pub const fn new(stocks: Arc<S>) -> Self {
        Self { stocks }
    }

    /// Reserves every line, or nothing if any SKU is short.
    #[instrument(name = "reservation.reserve", skip(self, items))]
    pub async fn reserve(&self, items: &[Item]) -> Result<(), LomsError> {
        self.apply(items, &reserve_units).await?;
        info!(lines = items.len(), "[reservation.reserve] stock reserved");
        Ok(())
    }

    /// Consumes reserved units for every line after payment.
    #[instrument(name = "reservation.reserve_remove", skip(self, items))]
    pub async fn reserve_remove(&self, items: &[Item]) -> Result<(), LomsError> {
        self.apply(items, &remove_reserved_units).await?;
        info!(lines = items.len(), "[reservation.reserve_remove] reserved stock consumed");
        Ok(())
    }

    /// Releases reserved units for every line after cancellation.
    #[instrument(name = "reservation.reserve_cancel", skip(self, items))]
    pub async fn reserve_cancel(&self, items: &[Item]) -> Result<(), LomsError> {
        self.apply(items, &cancel_reserved_units).await?;
        info!(lines = items.len(), "[reservation.reserve_cancel] reserved stock released");
        Ok(())
    }

    /// Units of `sku` that can still be reserved.
    #[instrument(name = "reservation.available", skip(self))]
    pub async fn available(&self, sku: Sku) -> Result<u32, LomsError> {
        let stocks = self.stocks.get_stocks(&[sku]).await?;
        let stock = stocks
            .into_iter()
            .find(|stock| stock.sku == sku)
            .ok_or(LomsError::StockNotFound(sku))?;
        stock.available()
    }

    async fn apply(
        &self,
        items: &[Item],
        adjust: &StockAdjustment,
    ) -> Result<(), LomsError> {
        let demand = StockDemand::from_items(items)?;
        if demand.is_empty() {
            return Ok(());
        }
        self.stocks.modify(&demand, adjust).await?;
        Ok(())
    }
}
