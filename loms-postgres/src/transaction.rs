//! Outbox transactions, one per shard.
//!
//! Pending rows are claimed with `FOR UPDATE SKIP LOCKED`; processed marks
//! become visible only when the transaction commits.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loms::{
    LomsError, Operation, OrderId, OutboxEvent, OutboxEventId, OutboxTransaction, Shard,
    ShardIndex, ShardRouter, StorageError, TransactionManager,
};
use sqlx::{query, query_as, FromRow, Postgres, Transaction};
use tracing::instrument;

use crate::{map_sqlx_error, PostgresDatabase};

#[derive(Debug, FromRow)]
struct OutboxRow {
    id: i64,
    order_id: i64,
    payload: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<OutboxRow> for OutboxEvent {
    type Error = StorageError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: OutboxEventId::new(row.id),
            order_id: OrderId::try_new(row.order_id)
                .map_err(|error| StorageError::corrupt(Operation::ReadOutbox, error.to_string()))?,
            payload: row.payload,
            created_at: row.created_at,
            processed: false,
        })
    }
}

/// Opens transactions on shard primaries.
#[derive(Debug, Clone)]
pub struct PostgresTransactionManager {
    router: Arc<ShardRouter<PostgresDatabase>>,
}

impl PostgresTransactionManager {
    /// Manager over every shard of `router`.
    pub const fn new(router: Arc<ShardRouter<PostgresDatabase>>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl TransactionManager for PostgresTransactionManager {
    type Transaction = PostgresTransaction;

    #[instrument(name = "postgres.begin", skip(self))]
    async fn begin(&self, shard: ShardIndex) -> Result<PostgresTransaction, LomsError> {
        let database = self.router.shard(shard).map(Shard::primary)?;
        let tx = database
            .pool()
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;
        Ok(PostgresTransaction { shard, tx })
    }

    async fn begin_all(&self) -> Result<Vec<PostgresTransaction>, LomsError> {
        let mut transactions = Vec::with_capacity(self.router.shard_count());
        for shard in self.router.indices() {
            transactions.push(self.begin(shard).await?);
        }
        Ok(transactions)
    }
}

/// A shard transaction; rolled back by sqlx when dropped uncommitted.
pub struct PostgresTransaction {
    shard: ShardIndex,
    tx: Transaction<'static, Postgres>,
}

impl std::fmt::Debug for PostgresTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresTransaction")
            .field("shard", &self.shard)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl OutboxTransaction for PostgresTransaction {
    fn shard(&self) -> ShardIndex {
        self.shard
    }

    async fn pending_events(&mut self, limit: usize) -> Result<Vec<OutboxEvent>, LomsError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = query_as::<_, OutboxRow>(
            "SELECT id, order_id, payload::text AS payload, created_at
             FROM outbox
             WHERE NOT processed
             ORDER BY created_at, id
             LIMIT $1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::ReadOutbox))?;

        rows.into_iter()
            .map(|row| OutboxEvent::try_from(row).map_err(LomsError::from))
            .collect()
    }

    async fn mark_processed(&mut self, id: OutboxEventId) -> Result<(), LomsError> {
        query("UPDATE outbox SET processed = TRUE, processed_at = now() WHERE id = $1")
            .bind(id.into_inner())
            .execute(&mut *self.tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::MarkProcessed))?;
        Ok(())
    }

    async fn commit(self) -> Result<(), LomsError> {
        self.tx
            .commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;
        Ok(())
    }
}
