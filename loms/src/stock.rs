//! Inventory rows and per-SKU demand aggregation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::LomsError;
use crate::order::Item;
use crate::types::Sku;

/// Inventory for one SKU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stock {
    /// SKU this row describes.
    pub sku: Sku,
    /// Units physically held.
    pub total_count: u32,
    /// Units promised to unpaid orders.
    pub reserved_count: u32,
}

impl Stock {
    /// Creates a stock row, rejecting a reservation larger than the total.
    pub fn new(sku: Sku, total_count: u32, reserved_count: u32) -> Result<Self, LomsError> {
        let stock = Self {
            sku,
            total_count,
            reserved_count,
        };
        stock.available()?;
        Ok(stock)
    }

    /// Units that can still be reserved.
    pub fn available(&self) -> Result<u32, LomsError> {
        self.total_count
            .checked_sub(self.reserved_count)
            .ok_or(LomsError::NegativeAvailable {
                sku: self.sku,
                total: self.total_count,
                reserved: self.reserved_count,
            })
    }
}

/// Requested units per SKU, with duplicate lines summed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StockDemand {
    counts: BTreeMap<Sku, u32>,
}

impl StockDemand {
    /// Aggregates order lines by SKU.
    ///
    /// Fails with invalid input when the summed count for one SKU overflows `u32`.
    pub fn from_items(items: &[Item]) -> Result<Self, LomsError> {
        let mut counts: BTreeMap<Sku, u32> = BTreeMap::new();
        for item in items {
            let entry = counts.entry(item.sku).or_default();
            *entry = entry.checked_add(item.count.into_inner()).ok_or_else(|| {
                LomsError::InvalidInput(format!("total count for sku {} overflows", item.sku))
            })?;
        }
        Ok(Self { counts })
    }

    /// SKUs in ascending order.
    pub fn skus(&self) -> Vec<Sku> {
        self.counts.keys().copied().collect()
    }

    /// `(sku, count)` pairs in ascending SKU order.
    pub fn iter(&self) -> impl Iterator<Item = (Sku, u32)> + '_ {
        self.counts.iter().map(|(sku, count)| (*sku, *count))
    }

    /// Requested count for `sku`, if any.
    pub fn get(&self, sku: Sku) -> Option<u32> {
        self.counts.get(&sku).copied()
    }

    /// Number of distinct SKUs.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// True when no SKU is requested.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
