//! Infrastructure for the order event bridge: source and queue adapters,
//! delivery tracking, dead-lettering, and the partition pipeline.

pub mod dead_letter;
pub mod delivery;
pub mod journal;
pub mod pipeline;
pub mod queue;
pub mod source;

#[cfg(test)]
mod integration_tests;

pub use dead_letter::{DeadLetterEntry, DeadLetterRouter, FailureReason, RoutingError};
pub use delivery::{DeliveryRecord, DeliveryState, DeliveryTracker, RetryPolicy, TrackerError, TrackingId};
pub use journal::{DeliveryJournal, InMemoryDeliveryJournal, JournalError};
pub use pipeline::{Bridge, BridgeHandle, BridgeStats, PipelineConfig, PipelineContext, ShutdownReport};
pub use queue::{InMemoryQueue, OutboundMessage, PublishError, QueueSink};
pub use source::{InMemoryLog, LogSource, SourceError};
