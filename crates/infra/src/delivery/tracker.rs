//! Per-partition acknowledgment state between the source log and the destination.
//!
//! A tracker is owned by exactly one partition worker, so it is a plain struct
//! with `&mut self` methods and no interior locking.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use orderflow_core::{MessageId, Offset, PartitionId};
use thiserror::Error;

use super::record::{DeliveryRecord, DeliveryState, TrackingId};
use super::retry::RetryPolicy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("tracking id {0} is not tracked")]
    UnknownTracking(TrackingId),

    #[error("offset {offset} is at or below committed offset {committed}")]
    AlreadyCommitted { offset: Offset, committed: Offset },

    #[error("offset {offset} arrived after higher offset {highest}")]
    OutOfOrder { offset: Offset, highest: Offset },

    #[error("tracking id {0} belongs to another partition")]
    WrongPartition(TrackingId),

    #[error("tracking id {0} failed without retry")]
    NotRetryable(TrackingId),

    #[error("tracking id {0} is already terminal")]
    AlreadyTerminal(TrackingId),

    #[error("offset {0} has non-terminal records at or below it")]
    NotSafeToCommit(Offset),
}

#[derive(Debug, Clone)]
pub struct DeliveryTracker {
    partition: PartitionId,
    policy: RetryPolicy,
    records: BTreeMap<Offset, DeliveryRecord>,
    highest_seen: Option<Offset>,
    committed: Option<Offset>,
}

impl DeliveryTracker {
    pub fn new(partition: PartitionId, policy: RetryPolicy) -> Self {
        Self {
            partition,
            policy,
            records: BTreeMap::new(),
            highest_seen: None,
            committed: None,
        }
    }

    /// Resume from the source's committed offset after a restart.
    pub fn resume(partition: PartitionId, policy: RetryPolicy, committed: Option<Offset>) -> Self {
        Self {
            highest_seen: committed,
            committed,
            ..Self::new(partition, policy)
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Start tracking a consumed offset.
    ///
    /// Beginning an offset that is already tracked returns the existing id.
    pub fn begin(&mut self, offset: Offset) -> Result<TrackingId, TrackerError> {
        let id = TrackingId::new(self.partition, offset);

        if let Some(committed) = self.committed {
            if offset <= committed {
                return Err(TrackerError::AlreadyCommitted { offset, committed });
            }
        }
        if self.records.contains_key(&offset) {
            return Ok(id);
        }
        if let Some(highest) = self.highest_seen {
            if offset <= highest {
                return Err(TrackerError::OutOfOrder { offset, highest });
            }
        }

        self.records.insert(offset, DeliveryRecord::new(id));
        self.highest_seen = Some(offset);
        Ok(id)
    }

    /// Open a publish attempt and return its 1-indexed number.
    pub fn start_attempt(&mut self, id: TrackingId) -> Result<u32, TrackerError> {
        let record = self.open_record(id)?;
        if let DeliveryState::Failed { retryable: false, .. } = record.state {
            return Err(TrackerError::NotRetryable(id));
        }
        Ok(record.open_attempt())
    }

    pub fn mark_delivered(
        &mut self,
        id: TrackingId,
        destination_id: MessageId,
    ) -> Result<(), TrackerError> {
        let record = self.open_record(id)?;
        record.close_attempt(true, None);
        record.destination_id = Some(destination_id.clone());
        record.next_attempt_at = None;
        record.state = DeliveryState::Delivered { destination_id };
        Ok(())
    }

    /// Record a transient publish failure.
    ///
    /// Returns `true` if another attempt is allowed. Once the attempt cap is
    /// reached the record becomes non-retryable and must be dead-lettered.
    pub fn mark_failed(
        &mut self,
        id: TrackingId,
        reason: impl Into<String>,
    ) -> Result<bool, TrackerError> {
        let policy = self.policy.clone();
        let record = self.open_record(id)?;
        if let DeliveryState::Failed { retryable: false, .. } = record.state {
            return Err(TrackerError::NotRetryable(id));
        }

        let reason = reason.into();
        if !has_open_attempt(record) {
            record.open_attempt();
        }
        record.close_attempt(false, Some(reason.clone()));
        record.last_error = Some(reason.clone());

        let retry = policy.should_retry(record.attempts);
        record.next_attempt_at = if retry {
            let delay = policy.delay_for(record.attempts, id);
            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default())
        } else {
            None
        };
        record.state = DeliveryState::Failed {
            reason,
            retryable: retry,
        };
        Ok(retry)
    }

    /// Record a failure that must not be retried.
    pub fn mark_fatal(&mut self, id: TrackingId, reason: impl Into<String>) -> Result<(), TrackerError> {
        let record = self.open_record(id)?;
        let reason = reason.into();
        record.close_attempt(false, Some(reason.clone()));
        record.last_error = Some(reason.clone());
        record.next_attempt_at = None;
        record.state = DeliveryState::Failed {
            reason,
            retryable: false,
        };
        Ok(())
    }

    pub fn mark_dead_lettered(
        &mut self,
        id: TrackingId,
        reason: impl Into<String>,
    ) -> Result<(), TrackerError> {
        let record = self.open_record(id)?;
        let reason = reason.into();
        record.close_attempt(false, Some(reason.clone()));
        record.next_attempt_at = None;
        record.state = DeliveryState::DeadLettered { reason };
        Ok(())
    }

    /// Backoff to wait before the next attempt of a retryable record.
    pub fn retry_delay(&self, id: TrackingId) -> Option<Duration> {
        let record = self.records.get(&id.offset)?;
        match record.state {
            DeliveryState::Failed { retryable: true, .. } => {
                Some(self.policy.delay_for(record.attempts, id))
            }
            _ => None,
        }
    }

    pub fn record(&self, id: TrackingId) -> Option<&DeliveryRecord> {
        if id.partition != self.partition {
            return None;
        }
        self.records.get(&id.offset)
    }

    /// True when every tracked offset at or below `offset` is terminal.
    ///
    /// Offsets beyond the highest consumed offset are never safe.
    pub fn is_safe_to_commit(&self, offset: Offset) -> bool {
        if self.committed.is_some_and(|committed| offset <= committed) {
            return true;
        }
        if self.highest_seen.is_none_or(|highest| offset > highest) {
            return false;
        }
        self.records
            .range(..=offset)
            .all(|(_, record)| record.is_terminal())
    }

    /// Highest offset below which every consumed record is terminal.
    pub fn watermark(&self) -> Option<Offset> {
        let mut watermark = self.committed;
        for (offset, record) in &self.records {
            if !record.is_terminal() {
                break;
            }
            watermark = Some(*offset);
        }
        watermark
    }

    pub fn committed(&self) -> Option<Offset> {
        self.committed
    }

    pub fn highest_seen(&self) -> Option<Offset> {
        self.highest_seen
    }

    /// The watermark, if it is ahead of the committed offset.
    pub fn commit_candidate(&self) -> Option<Offset> {
        let watermark = self.watermark()?;
        match self.committed {
            Some(committed) if watermark <= committed => None,
            _ => Some(watermark),
        }
    }

    /// Record a successful source commit and drop the committed records.
    ///
    /// Returns the number of records released.
    pub fn acknowledge_commit(&mut self, offset: Offset) -> Result<usize, TrackerError> {
        if !self.is_safe_to_commit(offset) {
            return Err(TrackerError::NotSafeToCommit(offset));
        }
        if self.committed.is_some_and(|committed| offset <= committed) {
            return Ok(0);
        }

        let retained = self.records.split_off(&offset.next());
        let released = std::mem::replace(&mut self.records, retained).len();
        self.committed = Some(offset);
        Ok(released)
    }

    /// Count of tracked records that are not yet terminal.
    pub fn in_flight(&self) -> usize {
        self.records.values().filter(|r| !r.is_terminal()).count()
    }

    /// Count of records still held, terminal or not.
    pub fn tracked(&self) -> usize {
        self.records.len()
    }

    /// Snapshot of the records that would be redelivered after a restart.
    pub fn uncommitted(&self) -> Vec<DeliveryRecord> {
        self.records.values().cloned().collect()
    }

    fn open_record(&mut self, id: TrackingId) -> Result<&mut DeliveryRecord, TrackerError> {
        if id.partition != self.partition {
            return Err(TrackerError::WrongPartition(id));
        }
        let record = self
            .records
            .get_mut(&id.offset)
            .ok_or(TrackerError::UnknownTracking(id))?;
        if record.is_terminal() {
            return Err(TrackerError::AlreadyTerminal(id));
        }
        Ok(record)
    }
}

fn has_open_attempt(record: &DeliveryRecord) -> bool {
    record
        .history
        .last()
        .is_some_and(|attempt| attempt.finished_at.is_none())
}
