//! Redis Streams queue: each message is one XADD entry, the entry id is the
//! destination message id.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tracing::instrument;

use orderflow_core::MessageId;

use super::{OutboundMessage, PublishError, QueueSink};

const BODY_FIELD: &str = "body";
const GROUP_KEY_FIELD: &str = "group_key";
const DEDUP_ID_FIELD: &str = "dedup_id";

#[derive(Clone)]
pub struct RedisStreamsQueue {
    stream_key: String,
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for RedisStreamsQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsQueue")
            .field("stream_key", &self.stream_key)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsQueue {
    pub async fn connect(redis_url: &str, stream_key: impl Into<String>) -> Result<Self, PublishError> {
        let client = redis::Client::open(redis_url).map_err(|e| PublishError::Fatal(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(classify)?;
        Ok(Self::from_connection(conn, stream_key))
    }

    /// Share an existing multiplexed connection.
    pub fn from_connection(conn: MultiplexedConnection, stream_key: impl Into<String>) -> Self {
        Self {
            stream_key: stream_key.into(),
            conn,
        }
    }
}

/// Connection-level problems are transient; anything the server rejected is not.
fn classify(e: redis::RedisError) -> PublishError {
    let transient = e.is_io_error()
        || e.is_timeout()
        || e.is_connection_dropped()
        || e.is_connection_refusal()
        || matches!(e.kind(), redis::ErrorKind::TryAgain | redis::ErrorKind::BusyLoadingError);
    if transient {
        PublishError::Transient(e.to_string())
    } else {
        PublishError::Fatal(e.to_string())
    }
}

fn stream_fields(message: &OutboundMessage) -> Vec<(String, String)> {
    let mut fields = Vec::with_capacity(message.attributes.len() + 3);
    fields.push((BODY_FIELD.to_string(), message.body.clone()));
    if let Some(group_key) = &message.group_key {
        fields.push((GROUP_KEY_FIELD.to_string(), group_key.clone()));
    }
    if let Some(dedup_id) = &message.dedup_id {
        fields.push((DEDUP_ID_FIELD.to_string(), dedup_id.clone()));
    }
    fields.extend(message.attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
    fields
}

#[async_trait]
impl QueueSink for RedisStreamsQueue {
    fn name(&self) -> &str {
        &self.stream_key
    }

    #[instrument(skip(self, message), fields(stream_key = %self.stream_key, dedup_id = ?message.dedup_id), err)]
    async fn send(&self, message: OutboundMessage) -> Result<MessageId, PublishError> {
        let fields = stream_fields(&message);
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(&self.stream_key, "*", &fields[..])
            .await
            .map_err(classify)?;
        Ok(MessageId::new(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_routing_fields_come_first() {
        let message = OutboundMessage::new("{}")
            .with_attribute("event_type", "OrderCreated")
            .with_group_key("cust_1")
            .with_dedup_id("0-5");

        let fields = stream_fields(&message);

        assert_eq!(fields[0], ("body".to_string(), "{}".to_string()));
        assert_eq!(fields[1], ("group_key".to_string(), "cust_1".to_string()));
        assert_eq!(fields[2], ("dedup_id".to_string(), "0-5".to_string()));
        assert_eq!(fields[3], ("event_type".to_string(), "OrderCreated".to_string()));
    }

    #[test]
    fn server_rejections_are_fatal() {
        let err = redis::RedisError::from((redis::ErrorKind::ResponseError, "ERR", "bad".to_string()));

        assert!(matches!(classify(err), PublishError::Fatal(_)));
    }

    #[test]
    fn io_errors_are_transient() {
        let err = redis::RedisError::from(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));

        assert!(classify(err).is_retryable());
    }
}
