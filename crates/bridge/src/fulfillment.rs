//! Demo fulfillment service: consumes `OrderCreated` from the destination
//! queue and writes the rest of each order's lifecycle back to the source log.
//!
//! Lifecycle events go through the bridge like any other record, so with the
//! in-memory backend every order schema is exercised end to end.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use orderflow_events::Event;
use orderflow_events::orders::{FULFILLMENT_SOURCE, Fulfillment, FulfillmentPlan, OrderCreated};
use orderflow_infra::queue::EVENT_TYPE_ATTRIBUTE;
use orderflow_infra::source::partition_for_key;
use orderflow_infra::{InMemoryLog, InMemoryQueue, OutboundMessage, SourceError};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RECEIVE_BATCH: usize = 10;

/// Poll `queue` every `poll_interval` and fulfill each created order until
/// `stop` is cancelled. Orders still being processed at that point are
/// abandoned. Returns the number of orders taken on.
pub fn spawn_fulfillment(
    queue: Arc<InMemoryQueue>,
    log: Arc<InMemoryLog>,
    partitions: u32,
    mut fulfillment: Fulfillment,
    poll_interval: Duration,
    stop: CancellationToken,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut in_progress = JoinSet::new();
        let mut accepted = 0;

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }

            while let Some(done) = in_progress.try_join_next() {
                if let Err(e) = done {
                    warn!(error = %e, "Fulfillment task panicked");
                }
            }

            for (id, message) in queue.receive(RECEIVE_BATCH) {
                let Some(order) = created_order(&message) else {
                    debug!(message_id = %id, "Skipping message");
                    continue;
                };
                let plan = fulfillment.plan();
                accepted += 1;
                in_progress.spawn(fulfill(log.clone(), partitions, order, plan));
            }
        }

        in_progress.shutdown().await;
        info!(accepted, "Fulfillment stopped");
        accepted
    })
}

/// The order carried by `message`, if it is an `OrderCreated`.
fn created_order(message: &OutboundMessage) -> Option<OrderCreated> {
    if message.attribute(EVENT_TYPE_ATTRIBUTE) != Some(OrderCreated::EVENT_TYPE) {
        return None;
    }
    match serde_json::from_str(&message.body) {
        Ok(order) => Some(order),
        Err(e) => {
            warn!(error = %e, "Unreadable OrderCreated body");
            None
        }
    }
}

async fn fulfill(log: Arc<InMemoryLog>, partitions: u32, order: OrderCreated, plan: FulfillmentPlan) {
    if let Err(e) = run_lifecycle(&log, partitions, &order, &plan).await {
        warn!(order_id = %order.order_id, error = %e, "Fulfillment failed");
    }
}

async fn run_lifecycle(
    log: &InMemoryLog,
    partitions: u32,
    order: &OrderCreated,
    plan: &FulfillmentPlan,
) -> Result<(), SourceError> {
    let partition = partition_for_key(&order.customer_id, partitions);

    let accepted = plan.accepted(order, Utc::now());
    log.append_event(partition, &accepted, FULFILLMENT_SOURCE)?;
    info!(
        order_id = %order.order_id,
        warehouse_id = %accepted.warehouse_id,
        estimated_ship_date = %accepted.estimated_ship_date,
        "Order accepted"
    );

    tokio::time::sleep(plan.processing_delay).await;

    let shipped = plan.shipped(order, Utc::now());
    log.append_event(partition, &shipped, FULFILLMENT_SOURCE)?;
    info!(
        order_id = %order.order_id,
        carrier = ?shipped.carrier,
        tracking_number = %shipped.tracking_number,
        estimated_delivery_date = %shipped.estimated_delivery_date,
        "Order shipped"
    );

    log.append_event(partition, &plan.fulfilled(order, Utc::now()), FULFILLMENT_SOURCE)?;
    info!(order_id = %order.order_id, "Order fulfilled");
    Ok(())
}
