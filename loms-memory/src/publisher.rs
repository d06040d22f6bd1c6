//! In-memory message bus.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use loms::{MessagePublisher, OutboxMessage, PublishError};
use parking_lot::Mutex;

/// Records every published message; can be switched to reject them.
#[derive(Debug, Default)]
pub struct InMemoryPublisher {
    messages: Mutex<Vec<OutboxMessage>>,
    failing: AtomicBool,
}

impl InMemoryPublisher {
    /// Empty bus accepting messages.
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, every publish fails.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Messages accepted so far, in publish order.
    pub fn messages(&self) -> Vec<OutboxMessage> {
        self.messages.lock().clone()
    }

    /// Removes and returns every accepted message.
    pub fn drain(&self) -> Vec<OutboxMessage> {
        std::mem::take(&mut *self.messages.lock())
    }
}

#[async_trait]
impl MessagePublisher for InMemoryPublisher {
    async fn publish(&self, message: &OutboxMessage) -> Result<(), PublishError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::for_message(message, "bus unavailable"));
        }
        self.messages.lock().push(message.clone());
        Ok(())
    }
}
