use chrono::{DateTime, Utc};
use orderflow_core::{MessageId, Offset, PartitionId};
use serde::{Deserialize, Serialize};

/// Handle for one tracked source record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackingId {
    pub partition: PartitionId,
    pub offset: Offset,
}

impl TrackingId {
    pub const fn new(partition: PartitionId, offset: Offset) -> Self {
        Self { partition, offset }
    }
}

impl std::fmt::Display for TrackingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.partition, self.offset)
    }
}

/// Delivery state of a tracked record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryState {
    /// Consumed, waiting for (or in the middle of) a publish attempt.
    Pending,
    /// Last publish attempt failed.
    Failed { reason: String, retryable: bool },
    /// Confirmed by the destination.
    Delivered { destination_id: MessageId },
    /// Written to the dead-letter queue.
    DeadLettered { reason: String },
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered { .. } | Self::DeadLettered { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed { .. } => "failed",
            Self::Delivered { .. } => "delivered",
            Self::DeadLettered { .. } => "dead_lettered",
        }
    }
}

/// Record of a publish attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub error: Option<String>,
}

impl AttemptRecord {
    fn finish(&mut self, success: bool, error: Option<String>) {
        self.finished_at = Some(Utc::now());
        self.success = success;
        self.error = error;
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.finished_at
            .map(|finished| (finished - self.started_at).num_milliseconds().max(0) as u64)
    }
}

/// Per-message delivery bookkeeping, owned by a [`DeliveryTracker`](super::DeliveryTracker).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub tracking_id: TrackingId,
    pub destination_id: Option<MessageId>,
    pub attempts: u32,
    pub state: DeliveryState,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub history: Vec<AttemptRecord>,
    pub created_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub(crate) fn new(tracking_id: TrackingId) -> Self {
        Self {
            tracking_id,
            destination_id: None,
            attempts: 0,
            state: DeliveryState::Pending,
            next_attempt_at: None,
            last_error: None,
            history: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn offset(&self) -> Offset {
        self.tracking_id.offset
    }

    pub fn partition(&self) -> PartitionId {
        self.tracking_id.partition
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub(crate) fn open_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.next_attempt_at = None;
        self.state = DeliveryState::Pending;
        self.history.push(AttemptRecord {
            attempt: self.attempts,
            started_at: Utc::now(),
            finished_at: None,
            success: false,
            error: None,
        });
        self.attempts
    }

    /// Close the open attempt, if there is one.
    pub(crate) fn close_attempt(&mut self, success: bool, error: Option<String>) {
        if let Some(last) = self.history.last_mut() {
            if last.finished_at.is_none() {
                last.finish(success, error);
            }
        }
    }
}
