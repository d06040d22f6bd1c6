//! Bulk stock loading from a JSON file.
//!
//! The file holds an array of `{"sku", "total_count", "reserved"}` records.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::errors::LomsError;
use crate::stock::Stock;
use crate::store::StockRepository;
use crate::types::Sku;

/// A stock seed that cannot be loaded.
#[derive(Debug, Error)]
pub enum SeedError {
    /// The file could not be read.
    #[error("failed to read stock seed {path}")]
    Io {
        /// Seed file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not a valid seed document.
    #[error("malformed stock seed")]
    Parse(#[source] serde_json::Error),

    /// A record reserves more than it holds.
    #[error("sku {sku}: reserved {reserved} exceeds total {total}")]
    ReservedExceedsTotal {
        /// Offending SKU.
        sku: u32,
        /// Declared total.
        total: u32,
        /// Declared reservation.
        reserved: u32,
    },

    /// The same SKU appears twice.
    #[error("sku {0} appears more than once")]
    DuplicateSku(u32),

    /// Writing the rows failed.
    #[error(transparent)]
    Store(#[from] LomsError),
}

#[derive(Debug, Deserialize)]
struct SeedRecord {
    sku: u32,
    total_count: u32,
    reserved: u32,
}

/// Parses and validates a seed document.
pub fn parse_stock_seed(json: &str) -> Result<Vec<Stock>, SeedError> {
    let records: Vec<SeedRecord> = serde_json::from_str(json).map_err(SeedError::Parse)?;
    let mut seen = HashSet::with_capacity(records.len());

    records
        .into_iter()
        .map(|record| {
            if !seen.insert(record.sku) {
                return Err(SeedError::DuplicateSku(record.sku));
            }
            Stock::new(Sku::new(record.sku), record.total_count, record.reserved).map_err(|_| {
                SeedError::ReservedExceedsTotal {
                    sku: record.sku,
                    total: record.total_count,
                    reserved: record.reserved,
                }
            })
        })
        .collect()
}

/// Reads and validates the seed file at `path`.
pub fn read_stock_seed(path: &Path) -> Result<Vec<Stock>, SeedError> {
    let json = std::fs::read_to_string(path).map_err(|source| SeedError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_stock_seed(&json)
}

/// Loads the seed file at `path` into `repository`, returning the row count.
pub async fn load_stock_seed<S: StockRepository + ?Sized>(
    repository: &S,
    path: &Path,
) -> Result<usize, SeedError> {
    let stocks = read_stock_seed(path)?;
    repository.upsert(&stocks).await?;
    info!(path = %path.display(), rows = stocks.len(), "[seed.load] stock seed loaded");
    Ok(stocks.len())
}
