//! Notification events published on the events channel.
//!
//! Fire-and-forget: no subscriber is required and nothing is redelivered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::broker::{Broker, BrokerResult};

/// Published after the overdue procedure ran.
pub const OVERDUE_TICKETS_PROCESSED: &str = "overdue_tickets_processed";

/// `{event, ...fields, timestamp}` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub event: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            fields: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Publish on `channel`. Returns the subscriber count reported by the broker.
    pub async fn publish<B>(&self, broker: &B, channel: &str) -> BrokerResult<u64>
    where
        B: Broker + ?Sized,
    {
        let message = serde_json::to_string(self)?;
        let receivers = broker.publish(channel, &message).await?;
        tracing::debug!(channel = %channel, event = %self.event, receivers, "Event published");
        Ok(receivers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;

    #[test]
    fn test_wire_shape_is_flat() {
        let event = NotificationEvent::new(OVERDUE_TICKETS_PROCESSED).with_field("count", 3);
        let value: Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "overdue_tickets_processed");
        assert_eq!(value["count"], 3);
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
        assert!(value.get("fields").is_none());
    }

    #[tokio::test]
    async fn test_publish_to_channel() {
        let broker = MemoryBroker::new();
        let event = NotificationEvent::new("ticket_created").with_field("ticket_id", "T1");
        event.publish(&broker, "events").await.unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "events");
        let decoded: NotificationEvent = serde_json::from_str(&published[0].1).unwrap();
        assert_eq!(decoded, event);
    }
}
