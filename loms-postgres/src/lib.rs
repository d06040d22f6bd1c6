//! PostgreSQL backend for LOMS.
//!
//! Each shard member is a [`PostgresDatabase`] wrapping its own sqlx pool.
//! [`PostgresCluster`] builds the router from configuration and hands out the
//! repositories and the outbox transaction manager.

mod repository;
mod rows;
mod transaction;

use std::sync::Arc;

use async_trait::async_trait;
use loms::{
    ConnectionSource, Operation, PoolConfig, Shard, ShardConfig, ShardIndex, ShardRouter,
    StorageError,
};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{query, Pool, Postgres};
use thiserror::Error;
use tracing::{error, info, instrument};

pub use repository::{PostgresOrderRepository, PostgresStockRepository};
pub use rows::{group_order_rows, OrderRow, StockRow};
pub use transaction::{PostgresTransaction, PostgresTransactionManager};

/// Failure to bring up the PostgreSQL backend.
#[derive(Debug, Error)]
pub enum PostgresBackendError {
    /// A shard database could not be reached.
    #[error("failed to create postgres connection pool for shard {shard}")]
    ConnectionFailed {
        /// Shard whose primary or replica failed.
        shard: usize,
        /// Driver error.
        #[source]
        source: sqlx::Error,
    },

    /// The configured shards do not form a valid router.
    #[error(transparent)]
    Topology(#[from] StorageError),
}

/// One physical PostgreSQL server.
#[derive(Debug, Clone)]
pub struct PostgresDatabase {
    pool: Pool<Postgres>,
}

impl PostgresDatabase {
    /// Connects eagerly, failing if the server is unreachable.
    pub async fn connect(url: &str, config: &PoolConfig) -> Result<Self, sqlx::Error> {
        let pool = pool_options(config).connect(url).await?;
        Ok(Self { pool })
    }

    /// Prepares a pool that connects on first use.
    pub fn connect_lazy(url: &str, config: &PoolConfig) -> Result<Self, sqlx::Error> {
        let pool = pool_options(config).connect_lazy(url)?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    pub const fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub const fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Round-trips a trivial query.
    pub async fn ping(&self) -> Result<(), StorageError> {
        query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Acquire))?;
        Ok(())
    }

    /// Applies the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|error| {
                error!(error = %error, "[postgres.migrate] migration failed");
                StorageError::failure(Operation::Migrate, error.to_string())
            })
    }
}

fn pool_options(config: &PoolConfig) -> PgPoolOptions {
    let max_connections: std::num::NonZeroU32 = config.max_connections.into();
    PgPoolOptions::new()
        .max_connections(max_connections.get())
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
}

#[async_trait]
impl ConnectionSource for PostgresDatabase {
    type Connection = PoolConnection<Postgres>;

    async fn acquire(&self) -> Result<PoolConnection<Postgres>, StorageError> {
        self.pool
            .acquire()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Acquire))
    }
}

/// Every shard of a PostgreSQL deployment behind one router.
#[derive(Debug, Clone)]
pub struct PostgresCluster {
    router: Arc<ShardRouter<PostgresDatabase>>,
}

impl PostgresCluster {
    /// Connects to every configured shard.
    ///
    /// Primaries must be reachable; replicas connect lazily, and an
    /// unreachable replica only sends its reads to the primary.
    #[instrument(name = "postgres.connect", skip_all, fields(shards = shards.len()))]
    pub async fn connect(
        shards: &[ShardConfig],
        pool: &PoolConfig,
    ) -> Result<Self, PostgresBackendError> {
        let mut members = Vec::with_capacity(shards.len());
        for (index, shard) in shards.iter().enumerate() {
            let primary = PostgresDatabase::connect(&shard.primary.url, pool)
                .await
                .map_err(|source| PostgresBackendError::ConnectionFailed { shard: index, source })?;
            let member = match &shard.replica {
                Some(replica) => {
                    let replica = PostgresDatabase::connect_lazy(&replica.url, pool).map_err(
                        |source| PostgresBackendError::ConnectionFailed { shard: index, source },
                    )?;
                    Shard::with_replica(primary, replica)
                }
                None => Shard::new(primary),
            };
            members.push(member);
        }

        info!(shards = members.len(), "[postgres.connect] shard pools ready");
        Ok(Self::from_router(Arc::new(ShardRouter::new(members)?)))
    }

    /// Wraps an existing router.
    pub const fn from_router(router: Arc<ShardRouter<PostgresDatabase>>) -> Self {
        Self { router }
    }

    /// Runs migrations on every shard primary.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        for index in self.router.indices() {
            self.primary(index)?.migrate().await?;
        }
        Ok(())
    }

    /// The shared router.
    pub fn router(&self) -> Arc<ShardRouter<PostgresDatabase>> {
        Arc::clone(&self.router)
    }

    /// Primary database of `shard`.
    pub fn primary(&self, shard: ShardIndex) -> Result<&PostgresDatabase, StorageError> {
        self.router.shard(shard).map(Shard::primary)
    }

    /// Stock repository on the default shard.
    pub fn stock_repository(&self) -> PostgresStockRepository {
        PostgresStockRepository::new(self.router())
    }

    /// Order repository over every shard.
    pub fn order_repository(&self) -> PostgresOrderRepository {
        PostgresOrderRepository::new(self.router())
    }

    /// Outbox transaction manager over every shard.
    pub fn transaction_manager(&self) -> PostgresTransactionManager {
        PostgresTransactionManager::new(self.router())
    }
}

pub(crate) fn map_sqlx_error(error: sqlx::Error, operation: Operation) -> StorageError {
    error!(
        error = %error,
        operation = %operation,
        "[postgres.database_error] database operation failed"
    );
    StorageError::failure(operation, error.to_string())
}
