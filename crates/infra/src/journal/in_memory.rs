use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use orderflow_core::PartitionId;

use super::{DeliveryJournal, JournalError};
use crate::delivery::DeliveryRecord;

#[derive(Debug, Default)]
pub struct InMemoryDeliveryJournal {
    records: RwLock<HashMap<PartitionId, Vec<DeliveryRecord>>>,
}

impl InMemoryDeliveryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total journaled records across partitions.
    pub fn total(&self) -> usize {
        self.records
            .read()
            .map(|records| records.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

fn poisoned(operation: &'static str) -> JournalError {
    JournalError::Storage {
        operation,
        message: "lock poisoned".to_string(),
    }
}

#[async_trait]
impl DeliveryJournal for InMemoryDeliveryJournal {
    async fn persist(&self, partition: PartitionId, records: &[DeliveryRecord]) -> Result<(), JournalError> {
        let mut all = self.records.write().map_err(|_| poisoned("persist"))?;
        if records.is_empty() {
            all.remove(&partition);
        } else {
            all.insert(partition, records.to_vec());
        }
        Ok(())
    }

    async fn load(&self, partition: PartitionId) -> Result<Vec<DeliveryRecord>, JournalError> {
        let all = self.records.read().map_err(|_| poisoned("load"))?;
        Ok(all.get(&partition).cloned().unwrap_or_default())
    }

    async fn clear(&self, partition: PartitionId) -> Result<(), JournalError> {
        self.records.write().map_err(|_| poisoned("clear"))?.remove(&partition);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{DeliveryTracker, RetryPolicy};
    use orderflow_core::Offset;

    fn pending_records(partition: PartitionId, n: u64) -> Vec<DeliveryRecord> {
        let mut tracker = DeliveryTracker::new(partition, RetryPolicy::default());
        for offset in 0..n {
            tracker.begin(Offset::new(offset)).unwrap();
        }
        tracker.uncommitted()
    }

    #[tokio::test]
    async fn persist_replaces_previous_records() {
        let journal = InMemoryDeliveryJournal::new();
        let p = PartitionId::new(0);

        journal.persist(p, &pending_records(p, 3)).await.unwrap();
        journal.persist(p, &pending_records(p, 1)).await.unwrap();

        assert_eq!(journal.load(p).await.unwrap().len(), 1);
        assert_eq!(journal.total(), 1);
    }

    #[tokio::test]
    async fn partitions_are_independent() {
        let journal = InMemoryDeliveryJournal::new();
        let (p0, p1) = (PartitionId::new(0), PartitionId::new(1));

        journal.persist(p0, &pending_records(p0, 2)).await.unwrap();
        journal.persist(p1, &pending_records(p1, 1)).await.unwrap();
        journal.clear(p0).await.unwrap();

        assert!(journal.load(p0).await.unwrap().is_empty());
        assert_eq!(journal.load(p1).await.unwrap().len(), 1);
    }
}
