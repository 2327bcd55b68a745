//! Raw records as read from the source log.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orderflow_core::{Offset, PartitionId};

/// Header carrying the event type tag (e.g. `OrderCreated`).
pub const EVENT_TYPE_HEADER: &str = "event_type";
/// Header carrying the payload schema version. Absent means version 1.
pub const SCHEMA_VERSION_HEADER: &str = "schema_version";
/// Header carrying the correlation id (the order id for order events).
pub const CORRELATION_ID_HEADER: &str = "correlation_id";
/// Header naming the producing service.
pub const SOURCE_HEADER: &str = "source";

/// An undecoded record from one partition of the source log.
///
/// Nothing about the payload is trusted at this point; the validator turns a
/// `SourceRecord` into an [`EventEnvelope`](crate::EventEnvelope) or a typed error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub partition: PartitionId,
    pub offset: Offset,
    pub key: Option<Vec<u8>>,
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl SourceRecord {
    pub fn new(partition: PartitionId, offset: Offset, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            partition,
            offset,
            key: None,
            headers: BTreeMap::new(),
            payload: payload.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn event_type(&self) -> Option<&str> {
        self.header(EVENT_TYPE_HEADER)
    }

    /// Key decoded as UTF-8, if present and valid.
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref().and_then(|k| std::str::from_utf8(k).ok())
    }

    /// Payload as text, replacing invalid UTF-8 sequences.
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}
