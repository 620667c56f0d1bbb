use std::sync::Arc;

use tracing::debug;

use crate::redis::{Client, CustomRedisError, StreamEntry};

/// Consumer-group view over the order stream for one named consumer.
/// Entries this consumer reads stay in the group's pending list until `ack`;
/// claiming another consumer's stale pending entries is left to external
/// tooling.
pub struct StreamConsumer {
    client: Arc<dyn Client + Send + Sync>,
    stream: String,
    group: String,
    consumer: String,
}

impl StreamConsumer {
    pub fn new(
        client: Arc<dyn Client + Send + Sync>,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Self {
        Self {
            client,
            stream: stream.to_owned(),
            group: group.to_owned(),
            consumer: consumer.to_owned(),
        }
    }

    /// Create the consumer group if it does not exist yet. Safe to call on
    /// every startup.
    pub async fn ensure_group(&self) -> Result<(), CustomRedisError> {
        self.client
            .ensure_group(self.stream.clone(), self.group.clone())
            .await
    }

    /// Read up to `max_count` entries not yet delivered to any consumer in
    /// the group, in stream order.
    pub async fn read_batch(&self, max_count: usize) -> Result<Vec<StreamEntry>, CustomRedisError> {
        self.client
            .read_group(
                self.stream.clone(),
                self.group.clone(),
                self.consumer.clone(),
                max_count,
            )
            .await
    }

    /// Mark an entry done for the group. Only to be called once the entry's
    /// side effects have durably completed; acking earlier would let a crash
    /// silently lose the item.
    pub async fn ack(&self, id: &str) -> Result<(), CustomRedisError> {
        let acked = self
            .client
            .ack(self.stream.clone(), self.group.clone(), id.to_owned())
            .await?;
        if acked == 0 {
            debug!(id, "entry was no longer pending at acknowledgment");
        }
        Ok(())
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }
}
