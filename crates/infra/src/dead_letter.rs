//! Dead-letter routing.
//!
//! Records that fail validation, are rejected outright by the destination, or
//! run out of publish attempts are written to a dead-letter queue together
//! with the reason and the attempt history. The router retries transient
//! dead-letter write failures a few times; a persistent failure is returned
//! to the caller, which must not commit the record's offset.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use orderflow_core::{DeadLetterId, MessageId, Offset, PartitionId};
use orderflow_events::{EventEnvelope, SourceRecord, ValidationError};

use crate::delivery::{AttemptRecord, RetryPolicy, TrackingId};
use crate::queue::{
    CORRELATION_ID_ATTRIBUTE, EVENT_TYPE_ATTRIBUTE, OutboundMessage, PublishError, QueueSink,
    SOURCE_OFFSET_ATTRIBUTE, SOURCE_PARTITION_ATTRIBUTE, dedup_id,
};

pub const FAILURE_REASON_ATTRIBUTE: &str = "failure_reason";
pub const ATTEMPTS_ATTRIBUTE: &str = "attempts";

/// Why a record was dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Never became an envelope.
    Validation { rule: String, message: String },
    /// Destination refused the message.
    PublishFatal { message: String },
    RetriesExhausted { attempts: u32, last_error: String },
}

impl FailureReason {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::PublishFatal { .. } => "publish_fatal",
            Self::RetriesExhausted { .. } => "retries_exhausted",
        }
    }
}

impl From<&ValidationError> for FailureReason {
    fn from(err: &ValidationError) -> Self {
        Self::Validation {
            rule: err.rule().to_string(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation { rule, message } => write!(f, "validation failed ({rule}): {message}"),
            Self::PublishFatal { message } => write!(f, "destination rejected message: {message}"),
            Self::RetriesExhausted { attempts, last_error } => {
                write!(f, "gave up after {attempts} attempts: {last_error}")
            }
        }
    }
}

/// Body of a dead-letter message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub partition: PartitionId,
    pub offset: Offset,
    pub event_type: Option<String>,
    pub schema_version: Option<u32>,
    pub correlation_id: Option<String>,
    pub headers: BTreeMap<String, String>,
    /// Original payload, lossily decoded when it was not UTF-8.
    pub raw_payload: String,
    /// Present when the record passed validation.
    pub envelope: Option<EventEnvelope>,
    pub reason: FailureReason,
    pub attempts: Vec<AttemptRecord>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn from_envelope(envelope: &EventEnvelope, reason: FailureReason, attempts: Vec<AttemptRecord>) -> Self {
        let mut headers = BTreeMap::new();
        if let Some(key) = envelope.key() {
            headers.insert("key".to_string(), key.to_string());
        }
        Self {
            id: DeadLetterId::new(),
            partition: envelope.partition(),
            offset: envelope.offset(),
            event_type: Some(envelope.event_type().to_string()),
            schema_version: Some(envelope.schema_version()),
            correlation_id: envelope.correlation_id().map(str::to_string),
            headers,
            raw_payload: envelope.payload().to_string(),
            envelope: Some(envelope.clone()),
            reason,
            attempts,
            dead_lettered_at: Utc::now(),
        }
    }

    pub fn from_record(record: &SourceRecord, reason: FailureReason, attempts: Vec<AttemptRecord>) -> Self {
        Self {
            id: DeadLetterId::new(),
            partition: record.partition,
            offset: record.offset,
            event_type: record.event_type().map(str::to_string),
            schema_version: record
                .header(orderflow_events::SCHEMA_VERSION_HEADER)
                .and_then(|v| v.parse().ok()),
            correlation_id: record
                .header(orderflow_events::CORRELATION_ID_HEADER)
                .map(str::to_string),
            headers: record.headers.clone(),
            raw_payload: record.payload_lossy(),
            envelope: None,
            reason,
            attempts,
            dead_lettered_at: Utc::now(),
        }
    }

    pub fn to_message(&self) -> Result<OutboundMessage, serde_json::Error> {
        let mut message = OutboundMessage::new(serde_json::to_string(self)?)
            .with_attribute(FAILURE_REASON_ATTRIBUTE, self.reason.kind())
            .with_attribute(ATTEMPTS_ATTRIBUTE, self.attempts.len().to_string())
            .with_attribute(SOURCE_PARTITION_ATTRIBUTE, self.partition.to_string())
            .with_attribute(SOURCE_OFFSET_ATTRIBUTE, self.offset.to_string())
            .with_dedup_id(dedup_id(self.partition, self.offset));
        if let Some(event_type) = &self.event_type {
            message = message.with_attribute(EVENT_TYPE_ATTRIBUTE, event_type.as_str());
        }
        if let Some(correlation_id) = &self.correlation_id {
            message = message.with_attribute(CORRELATION_ID_ATTRIBUTE, correlation_id.as_str());
        }
        Ok(message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("dead-letter entry could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("dead-letter queue write failed after {attempts} attempts: {source}")]
    Destination {
        attempts: u32,
        #[source]
        source: PublishError,
    },
}

#[derive(Clone)]
pub struct DeadLetterRouter {
    sink: Arc<dyn QueueSink>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for DeadLetterRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterRouter")
            .field("sink", &self.sink.name())
            .field("policy", &self.policy)
            .finish()
    }
}

impl DeadLetterRouter {
    pub fn new(sink: Arc<dyn QueueSink>) -> Self {
        Self {
            sink,
            policy: RetryPolicy::constant(3, Duration::from_millis(200)),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn destination(&self) -> &str {
        self.sink.name()
    }

    /// Dead-letter a validated event.
    pub async fn route(
        &self,
        envelope: &EventEnvelope,
        reason: FailureReason,
        attempts: Vec<AttemptRecord>,
    ) -> Result<MessageId, RoutingError> {
        self.route_entry(&DeadLetterEntry::from_envelope(envelope, reason, attempts))
            .await
    }

    /// Dead-letter a record that never validated.
    pub async fn route_record(
        &self,
        record: &SourceRecord,
        reason: FailureReason,
        attempts: Vec<AttemptRecord>,
    ) -> Result<MessageId, RoutingError> {
        self.route_entry(&DeadLetterEntry::from_record(record, reason, attempts))
            .await
    }

    pub async fn route_entry(&self, entry: &DeadLetterEntry) -> Result<MessageId, RoutingError> {
        let message = entry.to_message()?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.sink.send(message.clone()).await {
                Ok(id) => {
                    warn!(
                        partition = %entry.partition,
                        offset = %entry.offset,
                        dead_letter_id = %entry.id,
                        reason = %entry.reason,
                        destination = self.sink.name(),
                        "Message sent to dead-letter queue"
                    );
                    return Ok(id);
                }
                Err(e) if e.is_retryable() && self.policy.should_retry(attempt) => {
                    warn!(
                        partition = %entry.partition,
                        offset = %entry.offset,
                        attempt,
                        error = %e,
                        "Dead-letter write failed, retrying"
                    );
                    let delay = self
                        .policy
                        .delay_for(attempt, TrackingId::new(entry.partition, entry.offset));
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        partition = %entry.partition,
                        offset = %entry.offset,
                        attempt,
                        error = %e,
                        "Dead-letter write failed"
                    );
                    return Err(RoutingError::Destination {
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }
}
