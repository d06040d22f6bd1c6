//! Outbox processor.
//!
//! On every tick the processor opens one transaction per shard, drains up to
//! `batch_size` pending events from each shard concurrently, publishes them
//! and marks them processed before committing. A failure anywhere in a
//! shard's batch drops that shard's transaction, which rolls back the
//! processed flags; those events go out again on a later tick. Delivery is
//! therefore at-least-once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::OutboxConfig;
use crate::errors::LomsError;
use crate::outbox::OutboxMessage;
use crate::store::{OutboxTransaction, TransactionManager};
use crate::types::ShardIndex;

/// Shortest pause between ticks; a zero interval is raised to this.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// The bus rejected a message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to publish message with key {key} to {topic}: {detail}")]
pub struct PublishError {
    /// Topic the message was sent to.
    pub topic: String,
    /// Message key.
    pub key: String,
    /// Bus-specific description.
    pub detail: String,
}

impl PublishError {
    /// Error for `message` with the given detail.
    pub fn for_message(message: &OutboxMessage, detail: impl Into<String>) -> Self {
        Self {
            topic: message.topic.clone(),
            key: message.key.clone(),
            detail: detail.into(),
        }
    }
}

/// Destination for outbox messages.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Sends one message, returning once the bus has accepted it.
    async fn publish(&self, message: &OutboxMessage) -> Result<(), PublishError>;
}

#[async_trait]
impl<P: MessagePublisher + ?Sized> MessagePublisher for Arc<P> {
    async fn publish(&self, message: &OutboxMessage) -> Result<(), PublishError> {
        (**self).publish(message).await
    }
}

/// Retries a failed publish up to `retry_max` more times.
#[derive(Debug, Clone)]
pub struct RetryingPublisher<P> {
    inner: P,
    retry_max: u32,
}

impl<P> RetryingPublisher<P> {
    /// Wraps `inner`; `retry_max` of zero publishes once.
    pub const fn new(inner: P, retry_max: u32) -> Self {
        Self { inner, retry_max }
    }
}

#[async_trait]
impl<P: MessagePublisher> MessagePublisher for RetryingPublisher<P> {
    async fn publish(&self, message: &OutboxMessage) -> Result<(), PublishError> {
        let mut attempt = 0;
        loop {
            match self.inner.publish(message).await {
                Ok(()) => return Ok(()),
                Err(error) if attempt < self.retry_max => {
                    attempt += 1;
                    warn!(key = %message.key, attempt, error = %error, "[outbox.publish] retrying");
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Result of draining one shard.
#[derive(Debug)]
pub struct ShardOutcome {
    /// Shard that was drained.
    pub shard: ShardIndex,
    /// Events published and committed, or the failure that rolled the batch back.
    pub result: Result<usize, LomsError>,
}

/// What one tick did on every shard.
#[derive(Debug, Default)]
pub struct TickReport {
    /// One entry per shard, in shard order.
    pub shards: Vec<ShardOutcome>,
}

impl TickReport {
    /// Events committed as processed across all shards.
    pub fn published(&self) -> usize {
        self.shards
            .iter()
            .filter_map(|outcome| outcome.result.as_ref().ok())
            .sum()
    }

    /// Shards whose batch was rolled back.
    pub fn failures(&self) -> impl Iterator<Item = (ShardIndex, &LomsError)> {
        self.shards
            .iter()
            .filter_map(|outcome| outcome.result.as_ref().err().map(|error| (outcome.shard, error)))
    }

    /// True when every shard committed.
    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Periodically moves outbox events onto the bus.
pub struct OutboxProcessor<T, P> {
    transactions: Arc<T>,
    publisher: Arc<P>,
    config: OutboxConfig,
}

impl<T, P> std::fmt::Debug for OutboxProcessor<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxProcessor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<T: TransactionManager, P: MessagePublisher> OutboxProcessor<T, P> {
    /// Creates a processor.
    pub const fn new(transactions: Arc<T>, publisher: Arc<P>, config: OutboxConfig) -> Self {
        Self {
            transactions,
            publisher,
            config,
        }
    }

    /// Runs ticks every `config.interval` until `shutdown` is cancelled.
    ///
    /// A tick in flight when cancellation arrives runs to completion.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_ms = u64::try_from(self.config.interval.as_millis()).unwrap_or(u64::MAX),
            batch_size = self.config.batch_size,
            topic = %self.config.topic,
            "[outbox.run] processor started"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) => {
                            for (shard, error) in report.failures() {
                                warn!(shard = %shard, error = %error, "[outbox.tick] shard batch rolled back");
                            }
                            if report.published() > 0 {
                                info!(published = report.published(), "[outbox.tick] events published");
                            }
                        }
                        Err(error) => {
                            error!(error = %error, "[outbox.tick] failed to open shard transactions");
                        }
                    }
                }
            }
        }

        info!("[outbox.run] processor stopped");
    }

    /// Drains every shard once.
    ///
    /// Fails only if the shard transactions cannot be opened; per-shard
    /// failures are reported in the [`TickReport`].
    #[instrument(name = "outbox.tick", skip(self))]
    pub async fn tick(&self) -> Result<TickReport, LomsError> {
        let transactions = self.transactions.begin_all().await?;

        let shards = join_all(transactions.into_iter().map(|transaction| {
            let shard = transaction.shard();
            async move {
                ShardOutcome {
                    shard,
                    result: self.drain(transaction).await,
                }
            }
        }))
        .await;

        Ok(TickReport { shards })
    }

    async fn drain(&self, mut transaction: T::Transaction) -> Result<usize, LomsError> {
        let events = transaction.pending_events(self.config.batch_size).await?;
        if events.is_empty() {
            return Ok(0);
        }

        let mut published = 0;
        for event in &events {
            let message = OutboxMessage::from_event(&self.config.topic, event);
            self.publisher.publish(&message).await?;
            transaction.mark_processed(event.id).await?;
            published += 1;
            debug!(
                shard = %transaction.shard(),
                event_id = %event.id,
                order_id = %event.order_id,
                "[outbox.drain] event published"
            );
        }

        transaction.commit().await?;
        Ok(published)
    }
}
