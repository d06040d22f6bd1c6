//! Kafka message bus.
//!
//! Each message is keyed by its order id and hashed onto a partition with
//! 32-bit FNV-1a, so all events of one order share a partition and keep the
//! order they were produced in. Produce requests wait for every in-sync
//! replica before returning.

use std::collections::BTreeMap;

use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use loms::{MessagePublisher, OutboxMessage, PublishError};
use rskafka::client::partition::{Compression, PartitionClient, UnknownTopicHandling};
use rskafka::client::ClientBuilder;
use rskafka::record::Record;
use tracing::{debug, info, instrument};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Publishes outbox messages to one Kafka topic.
pub struct KafkaPublisher {
    topic: String,
    partitions: Vec<PartitionClient>,
}

impl std::fmt::Debug for KafkaPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaPublisher")
            .field("topic", &self.topic)
            .field("partitions", &self.partitions.len())
            .finish()
    }
}

impl KafkaPublisher {
    /// Bootstraps from `brokers` and opens a client for every partition of `topic`.
    ///
    /// The topic must already exist.
    pub async fn connect(brokers: &[String], topic: &str) -> Result<Self> {
        let client = ClientBuilder::new(brokers.to_vec())
            .build()
            .await
            .with_context(|| format!("failed to connect to kafka brokers {}", brokers.join(",")))?;

        let partition_count = client
            .list_topics()
            .await
            .context("failed to list kafka topics")?
            .into_iter()
            .find(|candidate| candidate.name == topic)
            .map(|found| found.partitions.len())
            .with_context(|| format!("kafka topic {topic} does not exist"))?;
        ensure!(partition_count > 0, "kafka topic {topic} has no partitions");

        let mut partitions = Vec::with_capacity(partition_count);
        for partition in 0..partition_count {
            let id = i32::try_from(partition).context("partition id out of range")?;
            let partition_client = client
                .partition_client(topic.to_owned(), id, UnknownTopicHandling::Retry)
                .await
                .with_context(|| format!("failed to open partition {id} of {topic}"))?;
            partitions.push(partition_client);
        }

        info!(
            topic,
            partitions = partition_count,
            "[kafka.connect] producer ready"
        );
        Ok(Self {
            topic: topic.to_owned(),
            partitions,
        })
    }
}

#[async_trait]
impl MessagePublisher for KafkaPublisher {
    #[instrument(name = "kafka.publish", skip(self, message), fields(key = %message.key))]
    async fn publish(&self, message: &OutboxMessage) -> Result<(), PublishError> {
        if message.topic != self.topic {
            return Err(PublishError::for_message(
                message,
                format!("producer is bound to topic {}", self.topic),
            ));
        }

        let partition = partition_for(message.key.as_bytes(), self.partitions.len());
        let client = self.partitions.get(partition).ok_or_else(|| {
            PublishError::for_message(message, format!("no client for partition {partition}"))
        })?;
        let offsets = client
            .produce(vec![record(message)], Compression::NoCompression)
            .await
            .map_err(|error| PublishError::for_message(message, error.to_string()))?;

        debug!(
            partition,
            offset = ?offsets.first(),
            "[kafka.publish] message acknowledged"
        );
        Ok(())
    }
}

/// Kafka record for `message`: key, value and timestamp carried over, no headers.
fn record(message: &OutboxMessage) -> Record {
    Record {
        key: Some(message.key.as_bytes().to_vec()),
        value: Some(message.value.clone()),
        headers: BTreeMap::new(),
        timestamp: message.timestamp,
    }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Partition for `key` out of `partitions`.
///
/// The hash is read as a signed 32-bit value and the remainder's magnitude is
/// taken, matching the hash partitioner other Kafka producers use by default.
fn partition_for(key: &[u8], partitions: usize) -> usize {
    let Ok(count) = i32::try_from(partitions) else {
        return 0;
    };
    if count == 0 {
        return 0;
    }
    let hash = i32::from_ne_bytes(fnv1a(key).to_ne_bytes());
    usize::try_from((hash % count).unsigned_abs()).unwrap_or_default()
}
