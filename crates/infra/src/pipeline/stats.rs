//! Runtime counters shared between partition workers and the status API.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};
use std::time::Instant;

use orderflow_core::{Offset, PartitionId};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    #[default]
    Starting,
    Running,
    /// Commits are failing; processing waits until a commit succeeds.
    Stalled,
    /// Stopped on an error an operator must resolve.
    Halted,
    Stopped,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PartitionStatus {
    pub state: PartitionState,
    pub committed: Option<Offset>,
    pub watermark: Option<Offset>,
    pub in_flight: usize,
    pub last_error: Option<String>,
}

#[derive(Debug)]
pub struct BridgeStats {
    started: Instant,
    received: AtomicU64,
    delivered: AtomicU64,
    dead_lettered: AtomicU64,
    validation_failures: AtomicU64,
    publish_retries: AtomicU64,
    commits: AtomicU64,
    commit_failures: AtomicU64,
    poll_failures: AtomicU64,
    partitions: RwLock<BTreeMap<PartitionId, PartitionStatus>>,
}

/// Serializable point-in-time copy of [`BridgeStats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub delivered: u64,
    pub dead_lettered: u64,
    pub validation_failures: u64,
    pub publish_retries: u64,
    pub commits: u64,
    pub commit_failures: u64,
    pub poll_failures: u64,
    pub uptime_secs: u64,
    pub partitions: BTreeMap<PartitionId, PartitionStatus>,
}

impl Default for BridgeStats {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            received: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            validation_failures: AtomicU64::new(0),
            publish_retries: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            commit_failures: AtomicU64::new(0),
            poll_failures: AtomicU64::new(0),
            partitions: RwLock::new(BTreeMap::new()),
        }
    }
}

impl BridgeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self, count: usize) {
        self.received.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_retry(&self) {
        self.publish_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit_failure(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_failure(&self) {
        self.poll_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_partition(&self, partition: PartitionId, update: impl FnOnce(&mut PartitionStatus)) {
        update(self.write().entry(partition).or_default());
    }

    pub fn partition(&self, partition: PartitionId) -> Option<PartitionStatus> {
        self.read().get(&partition).cloned()
    }

    /// False once any partition has halted.
    pub fn is_healthy(&self) -> bool {
        self.read()
            .values()
            .all(|status| status.state != PartitionState::Halted)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            publish_retries: self.publish_retries.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            poll_failures: self.poll_failures.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
            partitions: self.read().clone(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<PartitionId, PartitionStatus>> {
        self.partitions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<PartitionId, PartitionStatus>> {
        self.partitions.write().unwrap_or_else(PoisonError::into_inner)
    }
}
