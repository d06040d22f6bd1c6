//! Service configuration.
//!
//! The binary fills a [`LomsConfig`] from the environment and command line;
//! library code only consumes the typed sections it needs.

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

use nutype::nutype;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::MAX_SHARDS;

/// Environment variable prefix for a shard's primary URL, suffixed by shard index.
pub const MASTER_URL_PREFIX: &str = "DATABASE_MASTER_URL_";

/// Environment variable prefix for a shard's replica URL, suffixed by shard index.
pub const REPLICA_URL_PREFIX: &str = "DATABASE_REPLICA_URL_";

/// Configuration that cannot be used.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// No shard is configured.
    #[error("at least one shard must be configured")]
    NoShards,

    /// More shards than order ids can encode.
    #[error("{count} shards configured, at most {max} supported")]
    TooManyShards {
        /// Configured shard count.
        count: usize,
        /// Supported maximum.
        max: usize,
    },

    /// A shard has no primary URL.
    #[error("missing DATABASE_MASTER_URL_{shard}")]
    MissingPrimary {
        /// Shard index.
        shard: usize,
    },

    /// Outbox tick interval of zero.
    #[error("outbox interval must be positive")]
    ZeroInterval,

    /// Outbox batch size of zero.
    #[error("outbox batch size must be positive")]
    ZeroBatchSize,

    /// Outbox topic is empty.
    #[error("outbox topic must not be empty")]
    EmptyTopic,

    /// Kafka delivery selected without a broker to bootstrap from.
    #[error("at least one kafka broker must be configured")]
    NoBrokers,
}

/// Maximum number of connections per pool. At least one.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into, Serialize, Deserialize))]
pub struct MaxConnections(NonZeroU32);

/// Connection pool tuning, applied to every physical database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of connections in each pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for pooled connections (default: 10 minutes)
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: NonZeroU32 = match NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// One physical database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL.
    pub url: String,
}

/// Primary and optional replica of one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Database that takes writes.
    pub primary: DatabaseConfig,
    /// Read replica.
    pub replica: Option<DatabaseConfig>,
}

impl ShardConfig {
    /// Reads `shard_count` shards from `DATABASE_MASTER_URL_<i>` and
    /// `DATABASE_REPLICA_URL_<i>` through `lookup`.
    ///
    /// Empty values count as unset.
    pub fn from_lookup(
        shard_count: usize,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Vec<Self>, ConfigError> {
        let read = |name: String| lookup(&name).filter(|value| !value.trim().is_empty());

        (0..shard_count)
            .map(|shard| {
                let primary = read(format!("{MASTER_URL_PREFIX}{shard}"))
                    .ok_or(ConfigError::MissingPrimary { shard })?;
                let replica = read(format!("{REPLICA_URL_PREFIX}{shard}"));
                Ok(Self {
                    primary: DatabaseConfig { url: primary },
                    replica: replica.map(|url| DatabaseConfig { url }),
                })
            })
            .collect()
    }
}

/// Outbox processor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Pause between ticks.
    pub interval: Duration,
    /// Maximum events drained per shard per tick.
    pub batch_size: usize,
    /// Destination topic.
    pub topic: String,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 10,
            topic: "loms.order-events".to_owned(),
        }
    }
}

/// Where outbox messages are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// Kafka cluster reached through `brokers`.
    #[default]
    Kafka,
    /// Messages are only written to the log.
    Log,
}

/// Message bus delivery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Delivery target.
    pub kind: BusKind,
    /// Kafka bootstrap brokers as `host:port`.
    pub brokers: Vec<String>,
    /// Retries after a failed publish before the event is left for the next tick.
    pub retry_max: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            kind: BusKind::Kafka,
            brokers: vec!["localhost:9092".to_owned()],
            retry_max: 3,
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LomsConfig {
    /// Shards in index order.
    pub shards: Vec<ShardConfig>,
    /// Pool tuning.
    pub pool: PoolConfig,
    /// Outbox processor.
    pub outbox: OutboxConfig,
    /// Message bus.
    pub bus: BusConfig,
    /// JSON stock seed loaded at startup.
    pub stock_seed_path: Option<PathBuf>,
    /// HTTP listen address.
    pub http_addr: String,
}

impl LomsConfig {
    /// Rejects configurations the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shards.is_empty() {
            return Err(ConfigError::NoShards);
        }
        if self.shards.len() > MAX_SHARDS {
            return Err(ConfigError::TooManyShards {
                count: self.shards.len(),
                max: MAX_SHARDS,
            });
        }
        if self.outbox.interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if self.outbox.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.outbox.topic.trim().is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        if self.bus.kind == BusKind::Kafka
            && self.bus.brokers.iter().all(|broker| broker.trim().is_empty())
        {
            return Err(ConfigError::NoBrokers);
        }
        Ok(())
    }
}
