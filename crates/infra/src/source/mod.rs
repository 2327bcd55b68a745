//! Partitioned, offset-addressable source logs.
//!
//! A [`LogSource`] hands out records per partition in offset order and
//! remembers a committed offset per partition. After a restart, polling
//! resumes just after the last committed offset.

mod in_memory;
#[cfg(feature = "redis")]
mod redis_streams;

use std::sync::Arc;

use async_trait::async_trait;
use orderflow_core::{Offset, PartitionId};
use orderflow_events::SourceRecord;

pub use in_memory::InMemoryLog;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsSource;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source connection error: {0}")]
    Connection(String),

    #[error("poll failed on partition {partition}: {message}")]
    Poll { partition: PartitionId, message: String },

    #[error("commit of offset {offset} failed on partition {partition}: {message}")]
    Commit {
        partition: PartitionId,
        offset: Offset,
        message: String,
    },

    #[error("partition {0} is not assigned to this consumer")]
    UnknownPartition(PartitionId),
}

#[async_trait]
pub trait LogSource: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Partitions assigned to this consumer.
    fn partitions(&self) -> Vec<PartitionId>;

    /// Read up to `max` records in offset order. An empty batch means the
    /// partition is caught up.
    async fn poll(&self, partition: PartitionId, max: usize) -> Result<Vec<SourceRecord>, SourceError>;

    /// Commit everything up to and including `offset`.
    async fn commit(&self, partition: PartitionId, offset: Offset) -> Result<(), SourceError>;

    /// Last committed offset, in the numbering `poll` uses. Sources that
    /// renumber on reconnect report `None` until their first commit.
    async fn committed(&self, partition: PartitionId) -> Result<Option<Offset>, SourceError>;
}

#[async_trait]
impl<S: LogSource + ?Sized> LogSource for Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn partitions(&self) -> Vec<PartitionId> {
        (**self).partitions()
    }

    async fn poll(&self, partition: PartitionId, max: usize) -> Result<Vec<SourceRecord>, SourceError> {
        (**self).poll(partition, max).await
    }

    async fn commit(&self, partition: PartitionId, offset: Offset) -> Result<(), SourceError> {
        (**self).commit(partition, offset).await
    }

    async fn committed(&self, partition: PartitionId) -> Result<Option<Offset>, SourceError> {
        (**self).committed(partition).await
    }
}

/// Stable key-to-partition mapping (FNV-1a), so that one key always lands on
/// the same partition across processes.
pub fn partition_for_key(key: &str, partitions: u32) -> PartitionId {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let hash = key
        .bytes()
        .fold(FNV_OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME));
    PartitionId::new((hash % u64::from(partitions.max(1))) as u32)
}
