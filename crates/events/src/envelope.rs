use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;

use orderflow_core::{Offset, PartitionId};

/// A validated event, ready to be forwarded.
///
/// Envelopes are only produced by the validator, so holding one means the
/// payload matched its schema. Fields are private; an envelope never changes
/// after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    event_type: String,
    schema_version: u32,

    payload: JsonValue,

    partition: PartitionId,
    /// Position of the originating record in its partition.
    offset: Offset,
    ingested_at: DateTime<Utc>,

    key: Option<String>,
    correlation_id: Option<String>,
}

impl EventEnvelope {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_type: impl Into<String>,
        schema_version: u32,
        payload: JsonValue,
        partition: PartitionId,
        offset: Offset,
        ingested_at: DateTime<Utc>,
        key: Option<String>,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            schema_version,
            payload,
            partition,
            offset,
            ingested_at,
            key,
            correlation_id,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn into_payload(self) -> JsonValue {
        self.payload
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn offset(&self) -> Offset {
        self.offset
    }

    pub fn ingested_at(&self) -> DateTime<Utc> {
        self.ingested_at
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Decode the payload into a typed event.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}
