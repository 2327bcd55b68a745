//! Point-to-point queue destinations.
//!
//! Both the fulfillment queue and the dead-letter queue are [`QueueSink`]s.

mod in_memory;
#[cfg(feature = "redis")]
mod redis_streams;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use orderflow_core::{MessageId, Offset, PartitionId};
use orderflow_events::EventEnvelope;
use serde::{Deserialize, Serialize};

pub use in_memory::InMemoryQueue;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsQueue;

pub const EVENT_TYPE_ATTRIBUTE: &str = "event_type";
pub const SCHEMA_VERSION_ATTRIBUTE: &str = "schema_version";
pub const CORRELATION_ID_ATTRIBUTE: &str = "correlation_id";
pub const SOURCE_PARTITION_ATTRIBUTE: &str = "source_partition";
pub const SOURCE_OFFSET_ATTRIBUTE: &str = "source_offset";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// Timeouts, throttling, broker unavailable. Worth retrying.
    #[error("transient publish error: {0}")]
    Transient(String),

    /// The destination rejected the message; retrying will not help.
    #[error("fatal publish error: {0}")]
    Fatal(String),
}

impl PublishError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Message as written to a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub body: String,
    pub attributes: BTreeMap<String, String>,
    /// Messages sharing a group key are consumed in order.
    pub group_key: Option<String>,
    /// Lets the destination drop redeliveries of the same source record.
    pub dedup_id: Option<String>,
}

impl OutboundMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            attributes: BTreeMap::new(),
            group_key: None,
            dedup_id: None,
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_group_key(mut self, key: impl Into<String>) -> Self {
        self.group_key = Some(key.into());
        self
    }

    pub fn with_dedup_id(mut self, id: impl Into<String>) -> Self {
        self.dedup_id = Some(id.into());
        self
    }

    /// Forwarded form of a validated event: the payload as the body, routing
    /// metadata as attributes.
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self, serde_json::Error> {
        let mut message = Self::new(serde_json::to_string(envelope.payload())?)
            .with_attribute(EVENT_TYPE_ATTRIBUTE, envelope.event_type())
            .with_attribute(SCHEMA_VERSION_ATTRIBUTE, envelope.schema_version().to_string())
            .with_attribute(SOURCE_PARTITION_ATTRIBUTE, envelope.partition().to_string())
            .with_attribute(SOURCE_OFFSET_ATTRIBUTE, envelope.offset().to_string())
            .with_dedup_id(dedup_id(envelope.partition(), envelope.offset()));
        if let Some(correlation_id) = envelope.correlation_id() {
            message = message.with_attribute(CORRELATION_ID_ATTRIBUTE, correlation_id);
        }
        if let Some(key) = envelope.key() {
            message = message.with_group_key(key);
        }
        Ok(message)
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// Deduplication id for a source record, stable across redeliveries.
pub fn dedup_id(partition: PartitionId, offset: Offset) -> String {
    format!("{partition}-{offset}")
}

#[async_trait]
pub trait QueueSink: Send + Sync {
    fn name(&self) -> &str;

    /// Write one message; returns the id the destination assigned to it.
    async fn send(&self, message: OutboundMessage) -> Result<MessageId, PublishError>;
}

#[async_trait]
impl<Q: QueueSink + ?Sized> QueueSink for Arc<Q> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn send(&self, message: OutboundMessage) -> Result<MessageId, PublishError> {
        (**self).send(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn from_envelope_carries_routing_metadata() {
        let envelope = EventEnvelope::new(
            "OrderCreated",
            1,
            json!({"order_id": "ord_1"}),
            PartitionId::new(3),
            Offset::new(42),
            Utc::now(),
            Some("cust_1".to_string()),
            Some("ord_1".to_string()),
        );

        let message = OutboundMessage::from_envelope(&envelope).unwrap();

        assert_eq!(message.body, r#"{"order_id":"ord_1"}"#);
        assert_eq!(message.attribute(EVENT_TYPE_ATTRIBUTE), Some("OrderCreated"));
        assert_eq!(message.attribute(SCHEMA_VERSION_ATTRIBUTE), Some("1"));
        assert_eq!(message.attribute(CORRELATION_ID_ATTRIBUTE), Some("ord_1"));
        assert_eq!(message.attribute(SOURCE_PARTITION_ATTRIBUTE), Some("3"));
        assert_eq!(message.attribute(SOURCE_OFFSET_ATTRIBUTE), Some("42"));
        assert_eq!(message.group_key.as_deref(), Some("cust_1"));
        assert_eq!(message.dedup_id.as_deref(), Some("3-42"));
    }

    #[test]
    fn envelope_without_key_has_no_group() {
        let envelope = EventEnvelope::new(
            "OrderAccepted",
            1,
            json!({}),
            PartitionId::new(0),
            Offset::ZERO,
            Utc::now(),
            None,
            None,
        );

        let message = OutboundMessage::from_envelope(&envelope).unwrap();

        assert!(message.group_key.is_none());
        assert!(message.attribute(CORRELATION_ID_ATTRIBUTE).is_none());
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(PublishError::Transient("timeout".into()).is_retryable());
        assert!(!PublishError::Fatal("too large".into()).is_retryable());
    }
}
