use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use orderflow_core::{Offset, PartitionId};
use orderflow_events::{Event, SourceRecord, to_record};

use super::{LogSource, SourceError};

#[derive(Debug, Default)]
struct PartitionLog {
    records: Vec<SourceRecord>,
    committed: Option<Offset>,
    /// Next offset handed to `poll`.
    position: u64,
    failing_polls: u32,
    failing_commits: u32,
    commit_calls: u64,
}

impl PartitionLog {
    fn resume_position(&self) -> u64 {
        self.committed.map_or(0, |c| c.get() + 1)
    }
}

/// In-process partitioned log with consumer-group style commits.
///
/// Offsets are dense and start at zero in every partition. Supports simulated
/// restarts and injected poll/commit failures.
#[derive(Debug)]
pub struct InMemoryLog {
    name: String,
    partitions: BTreeMap<PartitionId, Mutex<PartitionLog>>,
}

impl InMemoryLog {
    pub fn new(name: impl Into<String>, partitions: u32) -> Self {
        Self {
            name: name.into(),
            partitions: (0..partitions.max(1))
                .map(|p| (PartitionId::new(p), Mutex::new(PartitionLog::default())))
                .collect(),
        }
    }

    fn partition(&self, partition: PartitionId) -> Result<MutexGuard<'_, PartitionLog>, SourceError> {
        self.partitions
            .get(&partition)
            .map(|log| log.lock().unwrap_or_else(PoisonError::into_inner))
            .ok_or(SourceError::UnknownPartition(partition))
    }

    /// Append a raw record without headers; the offset is assigned by the log.
    pub fn append(&self, partition: PartitionId, payload: impl Into<Vec<u8>>) -> Result<Offset, SourceError> {
        self.append_with(partition, payload, |record| record)
    }

    /// Append a raw record, letting `build` add a key and headers.
    pub fn append_with(
        &self,
        partition: PartitionId,
        payload: impl Into<Vec<u8>>,
        build: impl FnOnce(SourceRecord) -> SourceRecord,
    ) -> Result<Offset, SourceError> {
        let mut log = self.partition(partition)?;
        let offset = Offset::new(log.records.len() as u64);
        let mut record = build(SourceRecord::new(partition, offset, payload));
        record.partition = partition;
        record.offset = offset;
        log.records.push(record);
        Ok(offset)
    }

    /// Append a typed event with the standard headers.
    pub fn append_event<E: Event>(
        &self,
        partition: PartitionId,
        event: &E,
        source: &str,
    ) -> Result<Offset, SourceError> {
        let mut log = self.partition(partition)?;
        let offset = Offset::new(log.records.len() as u64);
        let record = to_record(event, partition, offset, source).map_err(|e| SourceError::Poll {
            partition,
            message: format!("event encoding failed: {e}"),
        })?;
        log.records.push(record);
        Ok(offset)
    }

    /// Simulate a consumer restart: uncommitted records will be polled again.
    pub fn restart(&self) {
        for log in self.partitions.values() {
            let mut log = log.lock().unwrap_or_else(PoisonError::into_inner);
            log.position = log.resume_position();
        }
    }

    pub fn fail_next_polls(&self, partition: PartitionId, count: u32) -> Result<(), SourceError> {
        self.partition(partition)?.failing_polls = count;
        Ok(())
    }

    pub fn fail_next_commits(&self, partition: PartitionId, count: u32) -> Result<(), SourceError> {
        self.partition(partition)?.failing_commits = count;
        Ok(())
    }

    /// Records appended to a partition, committed or not.
    pub fn partition_len(&self, partition: PartitionId) -> usize {
        self.partition(partition).map_or(0, |log| log.records.len())
    }

    /// Number of commit calls received (including failed ones).
    pub fn commit_calls(&self, partition: PartitionId) -> u64 {
        self.partition(partition).map_or(0, |log| log.commit_calls)
    }
}

#[async_trait]
impl LogSource for InMemoryLog {
    fn name(&self) -> &str {
        &self.name
    }

    fn partitions(&self) -> Vec<PartitionId> {
        self.partitions.keys().copied().collect()
    }

    async fn poll(&self, partition: PartitionId, max: usize) -> Result<Vec<SourceRecord>, SourceError> {
        let mut log = self.partition(partition)?;
        if log.failing_polls > 0 {
            log.failing_polls -= 1;
            return Err(SourceError::Poll {
                partition,
                message: "injected poll failure".to_string(),
            });
        }

        let start = (log.position as usize).min(log.records.len());
        let end = start.saturating_add(max).min(log.records.len());
        let batch = log.records[start..end].to_vec();
        log.position = end as u64;
        Ok(batch)
    }

    async fn commit(&self, partition: PartitionId, offset: Offset) -> Result<(), SourceError> {
        let mut log = self.partition(partition)?;
        log.commit_calls += 1;
        if log.failing_commits > 0 {
            log.failing_commits -= 1;
            return Err(SourceError::Commit {
                partition,
                offset,
                message: "injected commit failure".to_string(),
            });
        }
        if offset.get() >= log.position {
            return Err(SourceError::Commit {
                partition,
                offset,
                message: format!("offset was never consumed (next offset {})", log.position),
            });
        }

        log.committed = Some(log.committed.map_or(offset, |c| c.max(offset)));
        Ok(())
    }

    async fn committed(&self, partition: PartitionId) -> Result<Option<Offset>, SourceError> {
        Ok(self.partition(partition)?.committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P0: PartitionId = PartitionId::new(0);

    fn log_with(n: u64) -> InMemoryLog {
        let log = InMemoryLog::new("orders.created", 2);
        for i in 0..n {
            log.append_with(P0, format!("{{\"n\":{i}}}"), |r| r.with_header("event_type", "OrderCreated"))
                .unwrap();
        }
        log
    }

    #[tokio::test]
    async fn poll_hands_out_records_in_offset_order() {
        let log = log_with(5);

        let first = log.poll(P0, 3).await.unwrap();
        let second = log.poll(P0, 3).await.unwrap();
        let third = log.poll(P0, 3).await.unwrap();

        let offsets: Vec<u64> = first.iter().chain(&second).map(|r| r.offset.get()).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
        assert!(third.is_empty());
        assert_eq!(first[0].event_type(), Some("OrderCreated"));
    }

    #[tokio::test]
    async fn restart_replays_from_last_commit() {
        let log = log_with(5);
        log.poll(P0, 5).await.unwrap();
        log.commit(P0, Offset::new(1)).await.unwrap();

        log.restart();
        let replay = log.poll(P0, 10).await.unwrap();

        assert_eq!(replay.first().map(|r| r.offset.get()), Some(2));
        assert_eq!(replay.len(), 3);
    }

    #[tokio::test]
    async fn restart_without_commit_replays_everything() {
        let log = log_with(3);
        log.poll(P0, 3).await.unwrap();
        log.restart();

        assert_eq!(log.poll(P0, 10).await.unwrap().len(), 3);
        assert_eq!(log.committed(P0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn commit_rejects_unconsumed_offsets() {
        let log = log_with(3);
        log.poll(P0, 1).await.unwrap();

        assert!(matches!(
            log.commit(P0, Offset::new(2)).await,
            Err(SourceError::Commit { .. })
        ));
    }

    #[tokio::test]
    async fn commit_never_moves_backwards() {
        let log = log_with(3);
        log.poll(P0, 3).await.unwrap();
        log.commit(P0, Offset::new(2)).await.unwrap();
        log.commit(P0, Offset::new(0)).await.unwrap();

        assert_eq!(log.committed(P0).await.unwrap(), Some(Offset::new(2)));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let log = log_with(1);
        log.fail_next_polls(P0, 1).unwrap();
        log.fail_next_commits(P0, 1).unwrap();

        assert!(log.poll(P0, 1).await.is_err());
        assert_eq!(log.poll(P0, 1).await.unwrap().len(), 1);
        assert!(log.commit(P0, Offset::ZERO).await.is_err());
        assert!(log.commit(P0, Offset::ZERO).await.is_ok());
        assert_eq!(log.commit_calls(P0), 2);
    }

    #[tokio::test]
    async fn unknown_partition_is_an_error() {
        let log = log_with(0);
        let missing = PartitionId::new(9);

        assert!(matches!(
            log.poll(missing, 1).await,
            Err(SourceError::UnknownPartition(p)) if p == missing
        ));
    }
}
