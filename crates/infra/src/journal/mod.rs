//! Delivery journal: records that were still in flight when the bridge stopped.
//!
//! Journaled records are not replayed from here; the source log redelivers
//! them because their offsets were never committed. The journal lets an
//! operator see what was abandoned and how far each record got.

mod in_memory;
#[cfg(feature = "postgres")]
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use orderflow_core::PartitionId;

use crate::delivery::DeliveryRecord;

pub use in_memory::InMemoryDeliveryJournal;
#[cfg(feature = "postgres")]
pub use postgres::PostgresDeliveryJournal;

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal storage error in {operation}: {message}")]
    Storage { operation: &'static str, message: String },

    #[error("journal record could not be encoded: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[async_trait]
pub trait DeliveryJournal: Send + Sync {
    /// Replace the journaled records of a partition.
    async fn persist(&self, partition: PartitionId, records: &[DeliveryRecord]) -> Result<(), JournalError>;

    async fn load(&self, partition: PartitionId) -> Result<Vec<DeliveryRecord>, JournalError>;

    async fn clear(&self, partition: PartitionId) -> Result<(), JournalError>;
}

#[async_trait]
impl<J: DeliveryJournal + ?Sized> DeliveryJournal for Arc<J> {
    async fn persist(&self, partition: PartitionId, records: &[DeliveryRecord]) -> Result<(), JournalError> {
        (**self).persist(partition, records).await
    }

    async fn load(&self, partition: PartitionId) -> Result<Vec<DeliveryRecord>, JournalError> {
        (**self).load(partition).await
    }

    async fn clear(&self, partition: PartitionId) -> Result<(), JournalError> {
        (**self).clear(partition).await
    }
}
