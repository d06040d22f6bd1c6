//! Log-only message bus.

use async_trait::async_trait;
use loms::{MessagePublisher, OutboxMessage, PublishError};
use tracing::info;

/// Accepts every message and writes it to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

#[async_trait]
impl MessagePublisher for LogPublisher {
    async fn publish(&self, message: &OutboxMessage) -> Result<(), PublishError> {
        let payload = std::str::from_utf8(&message.value)
            .map_err(|error| PublishError::for_message(message, error.to_string()))?;
        info!(
            topic = %message.topic,
            key = %message.key,
            timestamp = %message.timestamp,
            payload,
            "[bus.publish] message published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tracing_test::traced_test;

    fn message(value: Vec<u8>) -> OutboxMessage {
        OutboxMessage {
            topic: "loms.order-events".to_owned(),
            key: "2001".to_owned(),
            value,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn logs_the_payload() {
        LogPublisher
            .publish(&message(br#"{"ID":2001}"#.to_vec()))
            .await
            .expect("accepted");
        assert!(logs_contain("[bus.publish] message published"));
        assert!(logs_contain("2001"));
    }

    #[tokio::test]
    async fn rejects_non_utf8_payloads() {
        let error = LogPublisher
            .publish(&message(vec![0xff, 0xfe]))
            .await
            .unwrap_err();
        assert_eq!(error.key, "2001");
    }
}
