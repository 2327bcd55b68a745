//! Runs one partition worker per assigned partition and coordinates shutdown.

use std::sync::Arc;
use std::time::Duration;

use orderflow_core::PartitionId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::stats::BridgeStats;
use super::worker::{PartitionReport, PartitionWorker, PipelineContext, WorkerExit};
use crate::journal::DeliveryJournal;

pub struct Bridge {
    ctx: PipelineContext,
    journal: Option<Arc<dyn DeliveryJournal>>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("ctx", &self.ctx)
            .field("journal", &self.journal.is_some())
            .finish()
    }
}

impl Bridge {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx, journal: None }
    }

    pub fn with_journal(mut self, journal: Arc<dyn DeliveryJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn stats(&self) -> Arc<BridgeStats> {
        self.ctx.stats.clone()
    }

    /// Spawn the partition workers.
    ///
    /// Records journaled by a previous run are logged and cleared; the source
    /// redelivers them because their offsets were never committed.
    pub async fn start(self) -> BridgeHandle {
        let partitions = self.ctx.source.partitions();

        if let Some(journal) = &self.journal {
            for &partition in &partitions {
                match journal.load(partition).await {
                    Ok(records) if !records.is_empty() => {
                        info!(
                            partition = %partition,
                            count = records.len(),
                            first_offset = %records[0].offset(),
                            "Records abandoned at last shutdown will be redelivered"
                        );
                        if let Err(e) = journal.clear(partition).await {
                            warn!(partition = %partition, error = %e, "Failed to clear delivery journal");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(partition = %partition, error = %e, "Failed to read delivery journal"),
                }
            }
        }

        let shutdown = CancellationToken::new();
        let abort = CancellationToken::new();
        let workers = partitions
            .iter()
            .map(|&partition| {
                let worker = PartitionWorker::new(partition, self.ctx.clone());
                let task = tokio::spawn(worker.run(shutdown.clone(), abort.clone()));
                (partition, task)
            })
            .collect();

        info!(
            source = self.ctx.source.name(),
            destination = self.ctx.destination.name(),
            dead_letter = self.ctx.dead_letters.destination(),
            partitions = partitions.len(),
            "Bridge started"
        );

        BridgeHandle {
            shutdown,
            abort,
            workers,
            stats: self.ctx.stats.clone(),
            journal: self.journal,
            drain_timeout: self.ctx.config.drain_timeout,
        }
    }
}

#[derive(Debug)]
pub struct ShutdownReport {
    pub partitions: Vec<PartitionReport>,
    /// True if the drain timeout expired and in-flight work was abandoned.
    pub forced: bool,
    pub journaled: usize,
}

impl ShutdownReport {
    pub fn partition(&self, partition: PartitionId) -> Option<&PartitionReport> {
        self.partitions.iter().find(|r| r.partition == partition)
    }
}

/// Handle to a running bridge.
pub struct BridgeHandle {
    shutdown: CancellationToken,
    abort: CancellationToken,
    workers: Vec<(PartitionId, JoinHandle<PartitionReport>)>,
    stats: Arc<BridgeStats>,
    journal: Option<Arc<dyn DeliveryJournal>>,
    drain_timeout: Duration,
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("partitions", &self.workers.iter().map(|(p, _)| *p).collect::<Vec<_>>())
            .field("drain_timeout", &self.drain_timeout)
            .finish_non_exhaustive()
    }
}

impl BridgeHandle {
    pub fn stats(&self) -> Arc<BridgeStats> {
        self.stats.clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.stats.is_healthy()
    }

    /// Request shutdown with the configured drain timeout.
    pub async fn shutdown(self) -> ShutdownReport {
        let timeout = self.drain_timeout;
        self.shutdown_within(timeout).await
    }

    /// Stop polling, let in-flight publishes finish for up to `drain_timeout`,
    /// then abandon whatever is left. Uncommitted records go to the journal.
    pub async fn shutdown_within(mut self, drain_timeout: Duration) -> ShutdownReport {
        info!(drain_timeout_ms = drain_timeout.as_millis() as u64, "Bridge shutting down");
        self.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + drain_timeout;
        let mut forced = false;
        let mut partitions = Vec::with_capacity(self.workers.len());

        for (partition, mut task) in std::mem::take(&mut self.workers) {
            let joined = match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    if !forced {
                        warn!("Drain timeout expired, abandoning in-flight work");
                        forced = true;
                        self.abort.cancel();
                    }
                    task.await
                }
            };
            match joined {
                Ok(report) => partitions.push(report),
                Err(e) => error!(partition = %partition, error = %e, "Partition worker panicked"),
            }
        }

        let journaled = self.journal_uncommitted(&partitions).await;
        for report in &partitions {
            if let WorkerExit::Halted(reason) = &report.exit {
                warn!(partition = %report.partition, reason = %reason, "Partition was halted at shutdown");
            }
        }
        info!(forced, journaled, "Bridge stopped");

        ShutdownReport {
            partitions,
            forced,
            journaled,
        }
    }

    async fn journal_uncommitted(&self, partitions: &[PartitionReport]) -> usize {
        let Some(journal) = &self.journal else {
            return 0;
        };

        let mut journaled = 0;
        for report in partitions {
            match journal.persist(report.partition, &report.uncommitted).await {
                Ok(()) => journaled += report.uncommitted.len(),
                Err(e) => error!(
                    partition = %report.partition,
                    records = report.uncommitted.len(),
                    error = %e,
                    "Failed to journal uncommitted records"
                ),
            }
        }
        journaled
    }
}
