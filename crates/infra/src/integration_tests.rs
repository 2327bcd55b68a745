//! End-to-end pipeline tests against the in-memory log and queues.
//!
//! Log -> Validator -> Destination queue | Dead-letter queue -> Commit
//!
//! Verifies:
//! - Offsets are committed only up to the highest contiguous terminal record
//! - Invalid and undeliverable records end up on the dead-letter queue
//! - Commit and dead-letter failures never lose a record
//! - Records left in flight at shutdown are redelivered, not dropped

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use orderflow_core::{Offset, PartitionId};
    use orderflow_events::orders::{ORDER_PRODUCER_SOURCE, OrderGenerator};
    use orderflow_events::{EVENT_TYPE_HEADER, InMemorySchemaRegistry, SchemaRegistry};

    use crate::dead_letter::{DeadLetterEntry, DeadLetterRouter, FAILURE_REASON_ATTRIBUTE, FailureReason};
    use crate::delivery::{DeliveryState, RetryPolicy};
    use crate::journal::{DeliveryJournal, InMemoryDeliveryJournal};
    use crate::pipeline::{
        Bridge, PartitionState, PartitionWorker, PipelineConfig, PipelineContext, WorkerError, WorkerExit,
    };
    use crate::queue::{InMemoryQueue, OutboundMessage, PublishError, SOURCE_PARTITION_ATTRIBUTE};
    use crate::source::{InMemoryLog, LogSource};

    const P0: PartitionId = PartitionId::new(0);
    const P1: PartitionId = PartitionId::new(1);

    struct Harness {
        log: Arc<InMemoryLog>,
        queue: Arc<InMemoryQueue>,
        dlq: Arc<InMemoryQueue>,
        ctx: PipelineContext,
        generator: OrderGenerator,
    }

    impl Harness {
        fn new(partitions: u32) -> Self {
            Self::with_queue(partitions, InMemoryQueue::new("orders.fulfillment"))
        }

        fn with_queue(partitions: u32, queue: InMemoryQueue) -> Self {
            let log = Arc::new(InMemoryLog::new("orders.created", partitions));
            let queue = Arc::new(queue);
            let dlq = Arc::new(InMemoryQueue::new("orders.fulfillment.dlq"));
            let registry: Arc<dyn SchemaRegistry> = Arc::new(InMemorySchemaRegistry::with_order_schemas());
            let config = PipelineConfig::default()
                .with_batch_size(10)
                .with_poll_interval(Duration::from_millis(5))
                .with_publish_retry(RetryPolicy::constant(3, Duration::from_millis(1)))
                .with_commit_backoff(RetryPolicy::constant(u32::MAX, Duration::from_millis(1)))
                .with_drain_timeout(Duration::from_millis(500));
            let dead_letters =
                DeadLetterRouter::new(dlq.clone()).with_policy(RetryPolicy::constant(2, Duration::from_millis(1)));
            let ctx = PipelineContext::new(log.clone(), queue.clone(), dead_letters, registry, config);

            Self {
                log,
                queue,
                dlq,
                ctx,
                generator: OrderGenerator::new(),
            }
        }

        fn with_config(mut self, update: impl FnOnce(PipelineConfig) -> PipelineConfig) -> Self {
            self.ctx.config = update(self.ctx.config.clone());
            self
        }

        fn append_order(&mut self, partition: PartitionId) -> Offset {
            let order = self.generator.next_order();
            self.log
                .append_event(partition, &order, ORDER_PRODUCER_SOURCE)
                .unwrap()
        }

        fn append_malformed(&self, partition: PartitionId) -> Offset {
            self.log
                .append_with(partition, "{not json", |r| r.with_header(EVENT_TYPE_HEADER, "OrderCreated"))
                .unwrap()
        }

        fn worker(&self, partition: PartitionId) -> PartitionWorker {
            PartitionWorker::new(partition, self.ctx.clone())
        }

        fn dedup_ids(&self) -> Vec<String> {
            self.queue
                .messages()
                .into_iter()
                .filter_map(|(_, m)| m.dedup_id)
                .collect()
        }

        fn dead_letters(&self) -> Vec<DeadLetterEntry> {
            self.dlq
                .messages()
                .iter()
                .map(|(_, m)| serde_json::from_str(&m.body).unwrap())
                .collect()
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met within 2s");
    }

    #[tokio::test]
    async fn five_valid_events_are_delivered_and_committed() {
        let mut h = Harness::new(1);
        for _ in 0..5 {
            h.append_order(P0);
        }
        let never = CancellationToken::new();
        let mut worker = h.worker(P0);

        let outcome = worker.poll_and_process(&never, &never).await.unwrap();

        assert_eq!(outcome.polled, 5);
        assert_eq!(outcome.delivered, 5);
        assert_eq!(outcome.committed, Some(Offset::new(4)));
        assert_eq!(h.log.committed(P0).await.unwrap(), Some(Offset::new(4)));
        assert_eq!(worker.tracker().tracked(), 0);
        assert_eq!(h.dedup_ids(), vec!["0-0", "0-1", "0-2", "0-3", "0-4"]);
        assert!(h.dlq.is_empty());

        let snapshot = h.ctx.stats.snapshot();
        assert_eq!(snapshot.received, 5);
        assert_eq!(snapshot.delivered, 5);
        assert_eq!(snapshot.commits, 1);
    }

    #[tokio::test]
    async fn forwarded_messages_keep_order_and_routing_metadata() {
        let mut h = Harness::new(1);
        h.append_order(P0);
        let never = CancellationToken::new();

        h.worker(P0).poll_and_process(&never, &never).await.unwrap();

        let (_, message) = &h.queue.messages()[0];
        let body: serde_json::Value = serde_json::from_str(&message.body).unwrap();
        assert_eq!(message.attribute("event_type"), Some("OrderCreated"));
        assert_eq!(message.attribute("correlation_id"), body["order_id"].as_str());
        assert_eq!(message.group_key.as_deref(), body["customer_id"].as_str());
    }

    #[tokio::test]
    async fn one_malformed_record_of_five_is_dead_lettered() {
        let mut h = Harness::new(1);
        h.append_order(P0);
        h.append_order(P0);
        let bad = h.append_malformed(P0);
        h.append_order(P0);
        h.append_order(P0);
        let never = CancellationToken::new();

        let outcome = h.worker(P0).poll_and_process(&never, &never).await.unwrap();

        assert_eq!(outcome.delivered, 4);
        assert_eq!(outcome.dead_lettered, 1);
        assert_eq!(h.log.committed(P0).await.unwrap(), Some(Offset::new(4)));
        assert_eq!(h.queue.len(), 4);

        let entries = h.dead_letters();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].offset, bad);
        assert_eq!(entries[0].raw_payload, "{not json");
        assert!(matches!(&entries[0].reason, FailureReason::Validation { rule, .. } if rule == "decode_error"));
        assert_eq!(h.ctx.stats.snapshot().validation_failures, 1);
    }

    #[tokio::test]
    async fn each_validation_failure_is_reported_with_its_rule() {
        let h = Harness::new(1);
        h.log
            .append_with(P0, r#"{"order_id":"ord_1"}"#, |r| r.with_header(EVENT_TYPE_HEADER, "OrderCreated"))
            .unwrap();
        h.log
            .append_with(P0, "{}", |r| r.with_header(EVENT_TYPE_HEADER, "OrderCancelled"))
            .unwrap();
        h.log.append(P0, "{}").unwrap();
        let never = CancellationToken::new();

        let outcome = h.worker(P0).poll_and_process(&never, &never).await.unwrap();

        assert_eq!(outcome.dead_lettered, 3);
        let rules: Vec<String> = h
            .dead_letters()
            .into_iter()
            .map(|entry| match entry.reason {
                FailureReason::Validation { rule, .. } => rule,
                other => panic!("unexpected reason {other:?}"),
            })
            .collect();
        assert_eq!(rules, vec!["missing_field", "unknown_event_type", "missing_header"]);
        assert_eq!(h.log.committed(P0).await.unwrap(), Some(Offset::new(2)));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_delivered() {
        let mut h = Harness::new(1);
        h.append_order(P0);
        h.queue.push_failure(PublishError::Transient("throttled".into()));
        h.queue.push_failure(PublishError::Transient("throttled".into()));
        let never = CancellationToken::new();
        let mut worker = h.worker(P0);

        let outcome = worker.poll_and_process(&never, &never).await.unwrap();

        assert_eq!(outcome.delivered, 1);
        assert_eq!(h.queue.send_calls(), 3);
        assert_eq!(h.ctx.stats.snapshot().publish_retries, 2);
        assert!(h.dlq.is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_the_record() {
        let mut h = Harness::new(1);
        h.append_order(P0);
        h.queue.set_unavailable(true);
        let never = CancellationToken::new();

        let outcome = h.worker(P0).poll_and_process(&never, &never).await.unwrap();

        assert_eq!(outcome.dead_lettered, 1);
        assert_eq!(h.queue.send_calls(), 3);
        assert_eq!(h.log.committed(P0).await.unwrap(), Some(Offset::new(0)));

        let entry = &h.dead_letters()[0];
        assert!(matches!(entry.reason, FailureReason::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(entry.attempts.len(), 3);
        assert!(entry.attempts.iter().all(|a| !a.success));
        assert!(entry.envelope.is_some());
    }

    #[tokio::test]
    async fn fatal_publish_error_dead_letters_without_retry() {
        let mut h = Harness::new(1);
        h.append_order(P0);
        h.append_order(P0);
        h.queue.push_failure(PublishError::Fatal("message too large".into()));
        let never = CancellationToken::new();

        let outcome = h.worker(P0).poll_and_process(&never, &never).await.unwrap();

        assert_eq!(outcome.dead_lettered, 1);
        assert_eq!(outcome.delivered, 1);
        assert_eq!(h.queue.send_calls(), 2);
        assert_eq!(
            h.dlq.messages()[0].1.attribute(FAILURE_REASON_ATTRIBUTE),
            Some("publish_fatal")
        );
        assert_eq!(h.log.committed(P0).await.unwrap(), Some(Offset::new(1)));
    }

    #[tokio::test]
    async fn commit_failures_stall_then_recover() {
        let mut h = Harness::new(1);
        for _ in 0..3 {
            h.append_order(P0);
        }
        h.log.fail_next_commits(P0, 2).unwrap();
        let never = CancellationToken::new();

        let outcome = h.worker(P0).poll_and_process(&never, &never).await.unwrap();

        assert_eq!(outcome.committed, Some(Offset::new(2)));
        assert_eq!(h.log.commit_calls(P0), 3);
        let snapshot = h.ctx.stats.snapshot();
        assert_eq!(snapshot.commit_failures, 2);
        assert_eq!(snapshot.partitions[&P0].state, PartitionState::Running);
        assert!(snapshot.partitions[&P0].last_error.is_none());
    }

    #[tokio::test]
    async fn replay_after_crash_redelivers_every_record() {
        let mut h = Harness::new(1);
        for _ in 0..5 {
            h.append_order(P0);
        }
        h.log.fail_next_commits(P0, u32::MAX).unwrap();

        let shutdown = CancellationToken::new();
        let abort = CancellationToken::new();
        let task = tokio::spawn(h.worker(P0).run(shutdown.clone(), abort.clone()));
        let queue = h.queue.clone();
        eventually(|| queue.len() == 5).await;
        abort.cancel();
        shutdown.cancel();
        let crashed = task.await.unwrap();

        assert_eq!(crashed.exit, WorkerExit::Aborted);
        assert_eq!(crashed.committed, None);
        assert_eq!(crashed.uncommitted.len(), 5);
        let first_run: BTreeSet<String> = h.dedup_ids().into_iter().collect();

        h.log.fail_next_commits(P0, 0).unwrap();
        h.log.restart();
        let never = CancellationToken::new();
        let mut worker = h.worker(P0);
        worker.resume().await.unwrap();
        let outcome = worker.poll_and_process(&never, &never).await.unwrap();

        assert_eq!(outcome.delivered, 5);
        assert_eq!(outcome.committed, Some(Offset::new(4)));
        assert_eq!(h.queue.len(), 10);
        let all: BTreeSet<String> = h.dedup_ids().into_iter().collect();
        assert_eq!(all, first_run);
    }

    #[tokio::test]
    async fn dead_letter_failure_halts_the_partition() {
        let mut h = Harness::new(1);
        h.append_order(P0);
        let bad = h.append_malformed(P0);
        h.append_order(P0);
        h.dlq.set_unavailable(true);
        let never = CancellationToken::new();

        let err = h.worker(P0).poll_and_process(&never, &never).await.unwrap_err();
        assert!(matches!(err, WorkerError::DeadLetter { offset, .. } if offset == bad));
        assert!(err.halts_partition());
        assert_eq!(h.queue.len(), 1);

        h.log.restart();
        let report = h.worker(P0).run(CancellationToken::new(), CancellationToken::new()).await;

        assert!(matches!(report.exit, WorkerExit::Halted(_)));
        assert_eq!(report.committed, Some(Offset::new(0)));
        assert_eq!(h.log.committed(P0).await.unwrap(), Some(Offset::new(0)));
        assert!(!h.ctx.stats.is_healthy());
        assert!(
            report
                .uncommitted
                .iter()
                .any(|r| r.offset() == bad && !r.is_terminal())
        );
    }

    #[tokio::test]
    async fn graceful_shutdown_journals_records_still_retrying() {
        let mut h = Harness::new(1)
            .with_config(|c| c.with_publish_retry(RetryPolicy::constant(5, Duration::from_secs(30))));
        h.append_order(P0);
        h.queue.set_unavailable(true);
        let journal = Arc::new(InMemoryDeliveryJournal::new());

        let handle = Bridge::new(h.ctx.clone()).with_journal(journal.clone()).start().await;
        let queue = h.queue.clone();
        eventually(|| queue.send_calls() >= 1).await;
        let report = handle.shutdown_within(Duration::from_secs(2)).await;

        assert!(!report.forced);
        assert_eq!(report.journaled, 1);
        let partition = report.partition(P0).unwrap();
        assert_eq!(partition.exit, WorkerExit::Drained);
        assert_eq!(partition.committed, None);

        let journaled = journal.load(P0).await.unwrap();
        assert_eq!(journaled.len(), 1);
        assert!(matches!(journaled[0].state, DeliveryState::Failed { retryable: true, .. }));
        assert_eq!(h.log.committed(P0).await.unwrap(), None);
        assert!(h.dlq.is_empty());
    }

    #[tokio::test]
    async fn forced_shutdown_abandons_in_flight_publish() {
        let mut h = Harness::with_queue(
            1,
            InMemoryQueue::new("orders.fulfillment").with_send_delay(Duration::from_secs(30)),
        );
        h.append_order(P0);

        let handle = Bridge::new(h.ctx.clone()).start().await;
        let queue = h.queue.clone();
        eventually(|| queue.send_calls() >= 1).await;
        let report = handle.shutdown_within(Duration::from_millis(50)).await;

        assert!(report.forced);
        let partition = report.partition(P0).unwrap();
        assert_eq!(partition.exit, WorkerExit::Aborted);
        assert_eq!(partition.uncommitted.len(), 1);
        assert!(h.queue.is_empty());
        assert_eq!(h.log.committed(P0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stuck_partition_does_not_block_others() {
        let mut h = Harness::new(2)
            .with_config(|c| c.with_publish_retry(RetryPolicy::constant(100, Duration::from_secs(30))));
        h.queue.reject_if(|m: &OutboundMessage| {
            (m.attribute(SOURCE_PARTITION_ATTRIBUTE) == Some("0"))
                .then(|| PublishError::Transient("partition 0 throttled".into()))
        });
        h.append_order(P0);
        for _ in 0..3 {
            h.append_order(P1);
        }

        let handle = Bridge::new(h.ctx.clone()).start().await;
        let stats = handle.stats();
        eventually(|| stats.partition(P1).and_then(|s| s.committed) == Some(Offset::new(2))).await;
        let report = handle.shutdown_within(Duration::from_secs(2)).await;

        assert_eq!(report.partition(P0).unwrap().committed, None);
        assert_eq!(h.log.committed(P1).await.unwrap(), Some(Offset::new(2)));
        assert_eq!(h.queue.len(), 3);
    }

    #[tokio::test]
    async fn journal_from_previous_run_is_cleared_on_start() {
        let h = Harness::new(1);
        let journal = Arc::new(InMemoryDeliveryJournal::new());
        let mut tracker = crate::delivery::DeliveryTracker::new(P0, RetryPolicy::default());
        tracker.begin(Offset::new(0)).unwrap();
        journal.persist(P0, &tracker.uncommitted()).await.unwrap();

        let handle = Bridge::new(h.ctx.clone()).with_journal(journal.clone()).start().await;
        assert_eq!(journal.total(), 0);

        let report = handle.shutdown_within(Duration::from_secs(1)).await;
        assert_eq!(report.journaled, 0);
    }
}
