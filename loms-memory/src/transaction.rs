//! Outbox transactions over in-memory shards.
//!
//! A transaction holds its shard's lock from `begin` until it is committed or
//! dropped. Processed flags are staged and only applied on commit, so a
//! dropped transaction leaves every event pending.

use std::sync::Arc;

use async_trait::async_trait;
use loms::{
    Intent, LomsError, Operation, OutboxEvent, OutboxEventId, OutboxTransaction, ShardIndex,
    ShardRouter, StorageError, TransactionManager,
};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::database::{MemoryDatabase, Tables};

/// Opens [`MemoryTransaction`]s on shard primaries.
#[derive(Debug, Clone)]
pub struct MemoryTransactionManager {
    router: Arc<ShardRouter<MemoryDatabase>>,
}

impl MemoryTransactionManager {
    /// Manager over every shard of `router`.
    pub const fn new(router: Arc<ShardRouter<MemoryDatabase>>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl TransactionManager for MemoryTransactionManager {
    type Transaction = MemoryTransaction;

    async fn begin(&self, shard: ShardIndex) -> Result<MemoryTransaction, LomsError> {
        let mut connection = self.router.pick_shard(shard, Intent::Write).await?;
        let tables = connection.primary_mut().lock(Operation::BeginTransaction).await?;
        Ok(MemoryTransaction {
            shard,
            tables,
            processed: Vec::new(),
        })
    }

    async fn begin_all(&self) -> Result<Vec<MemoryTransaction>, LomsError> {
        let mut transactions = Vec::with_capacity(self.router.shard_count());
        for shard in self.router.indices() {
            transactions.push(self.begin(shard).await?);
        }
        Ok(transactions)
    }
}

/// Exclusive unit of work on one shard.
#[derive(Debug)]
pub struct MemoryTransaction {
    shard: ShardIndex,
    tables: OwnedMutexGuard<Tables>,
    processed: Vec<OutboxEventId>,
}

#[async_trait]
impl OutboxTransaction for MemoryTransaction {
    fn shard(&self) -> ShardIndex {
        self.shard
    }

    async fn pending_events(&mut self, limit: usize) -> Result<Vec<OutboxEvent>, LomsError> {
        let mut pending: Vec<OutboxEvent> = self
            .tables
            .outbox
            .iter()
            .filter(|event| !event.processed && !self.processed.contains(&event.id))
            .cloned()
            .collect();
        pending.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_processed(&mut self, id: OutboxEventId) -> Result<(), LomsError> {
        let exists = self
            .tables
            .outbox
            .iter()
            .any(|event| event.id == id && !event.processed);
        if !exists {
            return Err(StorageError::failure(
                Operation::MarkProcessed,
                format!("no pending outbox event {id}"),
            )
            .into());
        }
        self.processed.push(id);
        Ok(())
    }

    async fn commit(mut self) -> Result<(), LomsError> {
        let processed = std::mem::take(&mut self.processed);
        for event in self
            .tables
            .outbox
            .iter_mut()
            .filter(|event| processed.contains(&event.id))
        {
            event.processed = true;
        }
        debug!(shard = %self.shard, events = processed.len(), "[memory.commit] outbox transaction committed");
        Ok(())
    }
}
