//! Partition worker: poll, validate, publish, commit.
//!
//! A worker owns one partition and that partition's [`DeliveryTracker`].
//! Records are handled one at a time in offset order, so there is at most one
//! in-flight publish per partition. After each batch the worker commits up
//! to the tracker's watermark; a failing commit is retried with backoff and
//! blocks further polling on this partition.

use std::sync::Arc;

use orderflow_core::{Offset, PartitionId};
use orderflow_events::{EventEnvelope, SchemaRegistry, SourceRecord, Validator};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::config::PipelineConfig;
use super::stage::{InvalidTransition, MessageFlow, Stage};
use super::stats::{BridgeStats, PartitionState};
use crate::dead_letter::{DeadLetterRouter, FailureReason, RoutingError};
use crate::delivery::{DeliveryRecord, DeliveryTracker, TrackerError, TrackingId};
use crate::queue::{OutboundMessage, PublishError, QueueSink};
use crate::source::{LogSource, SourceError};

/// Everything a partition worker needs, shared by all workers of a bridge.
#[derive(Clone)]
pub struct PipelineContext {
    pub source: Arc<dyn LogSource>,
    pub destination: Arc<dyn QueueSink>,
    pub dead_letters: DeadLetterRouter,
    pub validator: Validator<Arc<dyn SchemaRegistry>>,
    pub config: PipelineConfig,
    pub stats: Arc<BridgeStats>,
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("source", &self.source.name())
            .field("destination", &self.destination.name())
            .field("dead_letters", &self.dead_letters)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PipelineContext {
    pub fn new(
        source: Arc<dyn LogSource>,
        destination: Arc<dyn QueueSink>,
        dead_letters: DeadLetterRouter,
        registry: Arc<dyn SchemaRegistry>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            source,
            destination,
            dead_letters,
            validator: Validator::new(registry),
            config,
            stats: Arc::new(BridgeStats::new()),
        }
    }

    pub fn with_stats(mut self, stats: Arc<BridgeStats>) -> Self {
        self.stats = stats;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("dead-lettering offset {offset} on partition {partition} failed: {source}")]
    DeadLetter {
        partition: PartitionId,
        offset: Offset,
        #[source]
        source: RoutingError,
    },

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("worker aborted")]
    Aborted,
}

impl WorkerError {
    /// Errors that stop the partition until an operator intervenes.
    pub fn halts_partition(&self) -> bool {
        matches!(self, Self::DeadLetter { .. } | Self::Tracker(_) | Self::Transition(_))
    }
}

/// What happened to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Delivered,
    DeadLettered,
    /// Already terminal or below the committed offset; a redelivery.
    Skipped,
    /// Left non-terminal because shutdown was requested.
    Abandoned,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub polled: usize,
    pub delivered: usize,
    pub dead_lettered: usize,
    pub skipped: usize,
    pub abandoned: usize,
    /// Offset committed at the end of the batch, if the watermark moved.
    pub committed: Option<Offset>,
}

impl BatchOutcome {
    fn count(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Delivered => self.delivered += 1,
            Disposition::DeadLettered => self.dead_lettered += 1,
            Disposition::Skipped => self.skipped += 1,
            Disposition::Abandoned => self.abandoned += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Stopped after shutdown was requested, with in-flight work finished.
    Drained,
    /// Stopped by the forced-shutdown token.
    Aborted,
    Halted(String),
}

/// Final state of a partition when its worker stops.
#[derive(Debug, Clone)]
pub struct PartitionReport {
    pub partition: PartitionId,
    pub exit: WorkerExit,
    pub committed: Option<Offset>,
    pub watermark: Option<Offset>,
    /// Records above the committed offset; the source will redeliver them.
    pub uncommitted: Vec<DeliveryRecord>,
}

pub struct PartitionWorker {
    partition: PartitionId,
    ctx: PipelineContext,
    tracker: DeliveryTracker,
}

impl PartitionWorker {
    pub fn new(partition: PartitionId, ctx: PipelineContext) -> Self {
        let tracker = DeliveryTracker::new(partition, ctx.config.publish_retry.clone());
        Self { partition, ctx, tracker }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    /// Reload the committed offset from the source and start tracking above it.
    pub async fn resume(&mut self) -> Result<Option<Offset>, WorkerError> {
        let committed = self.ctx.source.committed(self.partition).await?;
        self.tracker = DeliveryTracker::resume(self.partition, self.ctx.config.publish_retry.clone(), committed);
        self.report_status(|_| {});
        Ok(committed)
    }

    /// Run until `shutdown` (graceful) or `abort` (forced) is cancelled, or
    /// until the partition halts.
    #[instrument(name = "partition_worker", skip_all, fields(partition = %self.partition))]
    pub async fn run(mut self, shutdown: CancellationToken, abort: CancellationToken) -> PartitionReport {
        let exit = self.run_loop(&shutdown, &abort).await;

        let state = match exit {
            WorkerExit::Halted(_) => PartitionState::Halted,
            _ => PartitionState::Stopped,
        };
        self.report_status(|status| status.state = state);

        let report = PartitionReport {
            partition: self.partition,
            exit,
            committed: self.tracker.committed(),
            watermark: self.tracker.watermark(),
            uncommitted: self.tracker.uncommitted(),
        };
        info!(
            committed = ?report.committed,
            uncommitted = report.uncommitted.len(),
            exit = ?report.exit,
            "Partition worker stopped"
        );
        report
    }

    async fn run_loop(&mut self, shutdown: &CancellationToken, abort: &CancellationToken) -> WorkerExit {
        loop {
            let resumed = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return WorkerExit::Drained,
                resumed = self.resume() => resumed,
            };
            match resumed {
                Ok(committed) => {
                    info!(committed = ?committed, source = self.ctx.source.name(), "Partition worker started");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load committed offset, retrying");
                    self.idle(shutdown).await;
                }
            }
        }
        self.report_status(|status| status.state = PartitionState::Running);

        while !shutdown.is_cancelled() {
            match self.poll_and_process(shutdown, abort).await {
                Ok(outcome) if outcome.polled == 0 => self.idle(shutdown).await,
                Ok(outcome) => {
                    debug!(
                        polled = outcome.polled,
                        delivered = outcome.delivered,
                        dead_lettered = outcome.dead_lettered,
                        committed = ?outcome.committed,
                        "Batch processed"
                    );
                }
                Err(WorkerError::Aborted) => return WorkerExit::Aborted,
                Err(WorkerError::Source(e)) => {
                    self.ctx.stats.record_poll_failure();
                    warn!(error = %e, "Poll failed");
                    self.idle(shutdown).await;
                }
                Err(e) => {
                    error!(error = %e, "Partition halted");
                    // Terminal records below the failure are still safe to commit.
                    if self.commit_watermark(abort).await.is_err() {
                        return WorkerExit::Aborted;
                    }
                    let message = e.to_string();
                    self.report_status(|status| status.last_error = Some(message.clone()));
                    return WorkerExit::Halted(message);
                }
            }
        }

        match self.commit_watermark(abort).await {
            Err(_) => WorkerExit::Aborted,
            Ok(_) => WorkerExit::Drained,
        }
    }

    async fn idle(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.ctx.config.poll_interval) => {}
        }
    }

    /// Poll one batch, process every record, then commit the watermark.
    pub async fn poll_and_process(
        &mut self,
        shutdown: &CancellationToken,
        abort: &CancellationToken,
    ) -> Result<BatchOutcome, WorkerError> {
        let records = tokio::select! {
            biased;
            _ = abort.cancelled() => return Err(WorkerError::Aborted),
            polled = self.ctx.source.poll(self.partition, self.ctx.config.batch_size) => polled?,
        };

        let mut outcome = BatchOutcome {
            polled: records.len(),
            ..Default::default()
        };
        if records.is_empty() {
            return Ok(outcome);
        }
        self.ctx.stats.record_received(records.len());

        let mut batch = Vec::with_capacity(records.len());
        for record in records {
            match self.tracker.begin(record.offset) {
                Ok(id) if self.tracker.record(id).is_some_and(DeliveryRecord::is_terminal) => {
                    outcome.count(Disposition::Skipped);
                }
                Ok(id) => batch.push((id, record)),
                Err(TrackerError::AlreadyCommitted { offset, .. }) => {
                    debug!(offset = %offset, "Skipping redelivered committed record");
                    outcome.count(Disposition::Skipped);
                }
                Err(e @ TrackerError::OutOfOrder { .. }) => {
                    warn!(error = %e, "Skipping out-of-order record");
                    outcome.count(Disposition::Skipped);
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.report_status(|_| {});

        for (id, record) in batch {
            if shutdown.is_cancelled() {
                outcome.count(Disposition::Abandoned);
                continue;
            }
            let disposition = self.process_record(id, &record, shutdown, abort).await?;
            outcome.count(disposition);
            self.report_status(|_| {});
        }

        outcome.committed = self.commit_watermark(abort).await?;
        Ok(outcome)
    }

    async fn process_record(
        &mut self,
        id: TrackingId,
        record: &SourceRecord,
        shutdown: &CancellationToken,
        abort: &CancellationToken,
    ) -> Result<Disposition, WorkerError> {
        let mut flow = MessageFlow::received();
        flow.to(Stage::Validating)?;

        match self.ctx.validator.validate(record) {
            Err(err) => {
                flow.to(Stage::Invalid)?;
                self.ctx.stats.record_validation_failure();
                warn!(
                    offset = %record.offset,
                    event_type = record.event_type().unwrap_or("<none>"),
                    rule = err.rule(),
                    error = %err,
                    "Record failed validation"
                );
                let reason = FailureReason::from(&err);
                let routed = tokio::select! {
                    biased;
                    _ = abort.cancelled() => return Err(WorkerError::Aborted),
                    routed = self.ctx.dead_letters.route_record(record, reason.clone(), Vec::new()) => routed,
                };
                self.settle_dead_letter(id, &mut flow, reason, routed)
            }
            Ok(envelope) => {
                flow.to(Stage::Validated)?;
                self.publish(id, &envelope, &mut flow, shutdown, abort).await
            }
        }
    }

    async fn publish(
        &mut self,
        id: TrackingId,
        envelope: &EventEnvelope,
        flow: &mut MessageFlow,
        shutdown: &CancellationToken,
        abort: &CancellationToken,
    ) -> Result<Disposition, WorkerError> {
        let message = match OutboundMessage::from_envelope(envelope) {
            Ok(message) => message,
            Err(e) => {
                flow.to(Stage::Publishing)?;
                flow.to(Stage::PublishFailed)?;
                self.tracker.mark_fatal(id, format!("message encoding failed: {e}"))?;
                let reason = FailureReason::PublishFatal {
                    message: format!("message encoding failed: {e}"),
                };
                return self.dead_letter_envelope(id, envelope, flow, reason, abort).await;
            }
        };

        loop {
            flow.to(Stage::Publishing)?;
            let attempt = self.tracker.start_attempt(id)?;

            let sent = tokio::select! {
                biased;
                _ = abort.cancelled() => return Err(WorkerError::Aborted),
                sent = self.ctx.destination.send(message.clone()) => sent,
            };

            let failure = match sent {
                Ok(destination_id) => {
                    flow.to(Stage::Delivered)?;
                    debug!(
                        offset = %id.offset,
                        event_type = envelope.event_type(),
                        attempt,
                        destination_id = %destination_id,
                        "Delivered"
                    );
                    self.tracker.mark_delivered(id, destination_id)?;
                    self.ctx.stats.record_delivered();
                    return Ok(Disposition::Delivered);
                }
                Err(failure) => failure,
            };
            flow.to(Stage::PublishFailed)?;

            match failure {
                PublishError::Fatal(message) => {
                    error!(
                        offset = %id.offset,
                        event_type = envelope.event_type(),
                        attempt,
                        error = %message,
                        "Destination rejected message"
                    );
                    self.tracker.mark_fatal(id, message.clone())?;
                    let reason = FailureReason::PublishFatal { message };
                    return self.dead_letter_envelope(id, envelope, flow, reason, abort).await;
                }
                PublishError::Transient(message) => {
                    if !self.tracker.mark_failed(id, message.clone())? {
                        warn!(
                            offset = %id.offset,
                            event_type = envelope.event_type(),
                            attempts = attempt,
                            error = %message,
                            "Publish retries exhausted"
                        );
                        let reason = FailureReason::RetriesExhausted {
                            attempts: attempt,
                            last_error: message,
                        };
                        return self.dead_letter_envelope(id, envelope, flow, reason, abort).await;
                    }

                    flow.to(Stage::Retrying)?;
                    self.ctx.stats.record_publish_retry();
                    let delay = self.tracker.retry_delay(id).unwrap_or_default();
                    warn!(
                        offset = %id.offset,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Publish failed, retrying"
                    );
                    self.report_status(|_| {});

                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(Disposition::Abandoned),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn dead_letter_envelope(
        &mut self,
        id: TrackingId,
        envelope: &EventEnvelope,
        flow: &mut MessageFlow,
        reason: FailureReason,
        abort: &CancellationToken,
    ) -> Result<Disposition, WorkerError> {
        let history = self
            .tracker
            .record(id)
            .map(|record| record.history.clone())
            .unwrap_or_default();
        let routed = tokio::select! {
            biased;
            _ = abort.cancelled() => return Err(WorkerError::Aborted),
            routed = self.ctx.dead_letters.route(envelope, reason.clone(), history) => routed,
        };
        self.settle_dead_letter(id, flow, reason, routed)
    }

    fn settle_dead_letter(
        &mut self,
        id: TrackingId,
        flow: &mut MessageFlow,
        reason: FailureReason,
        routed: Result<orderflow_core::MessageId, RoutingError>,
    ) -> Result<Disposition, WorkerError> {
        match routed {
            Ok(_) => {
                flow.to(Stage::DeadLettered)?;
                self.tracker.mark_dead_lettered(id, reason.to_string())?;
                self.ctx.stats.record_dead_lettered();
                Ok(Disposition::DeadLettered)
            }
            Err(source) => Err(WorkerError::DeadLetter {
                partition: id.partition,
                offset: id.offset,
                source,
            }),
        }
    }

    /// Commit up to the watermark if it moved, retrying until the source accepts.
    ///
    /// Only the forced-shutdown token interrupts the retries.
    pub async fn commit_watermark(&mut self, abort: &CancellationToken) -> Result<Option<Offset>, WorkerError> {
        let Some(candidate) = self.tracker.commit_candidate() else {
            return Ok(None);
        };

        let mut failures = 0u32;
        loop {
            let committed = tokio::select! {
                biased;
                _ = abort.cancelled() => return Err(WorkerError::Aborted),
                committed = self.ctx.source.commit(self.partition, candidate) => committed,
            };

            match committed {
                Ok(()) => {
                    let released = self.tracker.acknowledge_commit(candidate)?;
                    self.ctx.stats.record_commit();
                    if failures > 0 {
                        info!(offset = %candidate, failures, "Commit recovered");
                    }
                    debug!(offset = %candidate, released, "Committed");
                    self.report_status(|status| {
                        status.state = PartitionState::Running;
                        status.last_error = None;
                    });
                    return Ok(Some(candidate));
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    self.ctx.stats.record_commit_failure();
                    let delay = self
                        .ctx
                        .config
                        .commit_backoff
                        .delay_for(failures, TrackingId::new(self.partition, candidate));
                    error!(
                        offset = %candidate,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Commit failed, partition stalled"
                    );
                    let message = e.to_string();
                    self.report_status(|status| {
                        status.state = PartitionState::Stalled;
                        status.last_error = Some(message);
                    });

                    tokio::select! {
                        biased;
                        _ = abort.cancelled() => return Err(WorkerError::Aborted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn report_status(&self, update: impl FnOnce(&mut super::stats::PartitionStatus)) {
        let committed = self.tracker.committed();
        let watermark = self.tracker.watermark();
        let in_flight = self.tracker.in_flight();
        self.ctx.stats.update_partition(self.partition, |status| {
            status.committed = committed;
            status.watermark = watermark;
            status.in_flight = in_flight;
            update(status);
        });
    }
}
