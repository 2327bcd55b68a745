use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};

use orderflow_core::{Offset, PartitionId};

use crate::record::{
    CORRELATION_ID_HEADER, EVENT_TYPE_HEADER, SCHEMA_VERSION_HEADER, SOURCE_HEADER, SourceRecord,
};
use crate::schema::EventSchema;

/// A typed domain event that travels through the bridge.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - **keyed** (the partition key decides per-key ordering in the log)
pub trait Event: Serialize + DeserializeOwned + Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event type tag carried in the `event_type` header.
    const EVENT_TYPE: &'static str;

    /// Schema version of this Rust representation.
    const SCHEMA_VERSION: u32 = 1;

    /// Schema the validator enforces for this event type and version.
    fn schema() -> EventSchema;

    /// Key used to pick a partition (per-key ordering).
    fn partition_key(&self) -> &str;

    /// Identifier tying together all events of one business process.
    fn correlation_id(&self) -> &str;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// Encode a typed event as a source record, with the standard headers.
pub fn to_record<E: Event>(
    event: &E,
    partition: PartitionId,
    offset: Offset,
    source: &str,
) -> Result<SourceRecord, serde_json::Error> {
    let payload = serde_json::to_vec(event)?;
    Ok(SourceRecord::new(partition, offset, payload)
        .with_key(event.partition_key())
        .with_header(EVENT_TYPE_HEADER, E::EVENT_TYPE)
        .with_header(SCHEMA_VERSION_HEADER, E::SCHEMA_VERSION.to_string())
        .with_header(CORRELATION_ID_HEADER, event.correlation_id())
        .with_header(SOURCE_HEADER, source))
}
