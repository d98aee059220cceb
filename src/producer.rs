//! Producer side: what the API layer does to feed the worker.

use crate::broker::{Broker, BrokerResult, SharedBroker};
use crate::envelope::TaskEnvelope;
use crate::events::NotificationEvent;
use crate::queues::QueueNames;

/// Enqueues tasks onto the main queue and publishes events.
#[derive(Clone)]
pub struct Producer {
    broker: SharedBroker,
    queues: QueueNames,
}

impl Producer {
    pub fn new(broker: SharedBroker, queues: QueueNames) -> Self {
        Self { broker, queues }
    }

    /// Append an envelope to the tail of the main queue.
    ///
    /// Returns the queue length after the push.
    pub async fn enqueue(&self, envelope: &TaskEnvelope) -> BrokerResult<u64> {
        let json = envelope.to_json()?;
        let len = self.enqueue_raw(json).await?;
        tracing::debug!(kind = %envelope.kind, queue_len = len, "Task enqueued");
        Ok(len)
    }

    /// Append an arbitrary payload, bypassing envelope encoding.
    pub async fn enqueue_raw(&self, payload: impl Into<String>) -> BrokerResult<u64> {
        self.broker
            .push(self.queues.main(), &[payload.into()])
            .await
    }

    /// Publish an event on the notification channel.
    pub async fn notify(&self, event: &NotificationEvent) -> BrokerResult<u64> {
        event.publish(&self.broker, self.queues.events()).await
    }

    /// Number of tasks waiting in the main queue.
    pub async fn queue_len(&self) -> BrokerResult<u64> {
        self.broker.len(self.queues.main()).await
    }
}
