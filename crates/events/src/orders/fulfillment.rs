//! Fulfillment of created orders: accept at a warehouse, ship, fulfill.
//!
//! Every random choice for one order is drawn up front into a
//! [`FulfillmentPlan`]; turning the plan into events is then a pure function
//! of the order and the clock.

use std::time::Duration;

use chrono::{DateTime, Days, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{Carrier, OrderAccepted, OrderCreated, OrderFulfilled, OrderShipped};

/// `source` header written by the fulfillment stage.
pub const FULFILLMENT_SOURCE: &str = "order-fulfillment";

pub const WAREHOUSES: [&str; 3] = ["wh_east_01", "wh_west_01", "wh_central_01"];

/// Days from acceptance to the estimated ship date.
pub const SHIP_AFTER_DAYS: std::ops::RangeInclusive<u64> = 1..=3;

/// Days from shipping to the estimated delivery date.
pub const DELIVERY_AFTER_DAYS: std::ops::RangeInclusive<u64> = 2..=5;

/// Tracking number in the carrier's format.
pub fn tracking_number(carrier: Carrier, rng: &mut impl Rng) -> String {
    match carrier {
        Carrier::Ups => format!(
            "1Z{}AA{}",
            rng.gen_range(100..=999u32),
            rng.gen_range(10_000_000..=99_999_999u32)
        ),
        Carrier::Usps => format!("94{}", rng.gen_range(10_000_000_000_000_000..=99_999_999_999_999_999u64)),
        Carrier::Fedex | Carrier::Dhl => rng.gen_range(1_000_000_000..=9_999_999_999u64).to_string(),
    }
}

/// Choices made for one order before any event is emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentPlan {
    pub warehouse_id: &'static str,
    pub ship_after_days: u64,
    pub carrier: Carrier,
    pub tracking_number: String,
    pub delivery_after_days: u64,
    /// Simulated warehouse work between acceptance and shipping.
    pub processing_delay: Duration,
}

impl FulfillmentPlan {
    pub fn accepted(&self, order: &OrderCreated, now: DateTime<Utc>) -> OrderAccepted {
        OrderAccepted {
            order_id: order.order_id.clone(),
            customer_id: order.customer_id.clone(),
            accepted_at: now,
            estimated_ship_date: days_after(now, self.ship_after_days),
            warehouse_id: self.warehouse_id.to_string(),
        }
    }

    pub fn shipped(&self, order: &OrderCreated, now: DateTime<Utc>) -> OrderShipped {
        OrderShipped {
            order_id: order.order_id.clone(),
            customer_id: order.customer_id.clone(),
            tracking_number: self.tracking_number.clone(),
            carrier: self.carrier,
            shipped_at: now,
            estimated_delivery_date: days_after(now, self.delivery_after_days),
            warehouse_id: self.warehouse_id.to_string(),
        }
    }

    pub fn fulfilled(&self, order: &OrderCreated, now: DateTime<Utc>) -> OrderFulfilled {
        OrderFulfilled {
            order_id: order.order_id.clone(),
            customer_id: order.customer_id.clone(),
            fulfilled_at: now,
            tracking_number: self.tracking_number.clone(),
            carrier: self.carrier,
            total_amount: order.total_amount,
        }
    }
}

fn days_after(now: DateTime<Utc>, days: u64) -> chrono::NaiveDate {
    let today = now.date_naive();
    today.checked_add_days(Days::new(days)).unwrap_or(today)
}

/// Draws [`FulfillmentPlan`]s.
#[derive(Debug)]
pub struct Fulfillment<R = StdRng> {
    rng: R,
    max_processing_delay: Duration,
}

impl Fulfillment<StdRng> {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Reproducible plans, for tests.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }
}

impl Default for Fulfillment<StdRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Rng> Fulfillment<R> {
    pub fn with_rng(rng: R) -> Self {
        Self {
            rng,
            max_processing_delay: Duration::from_secs(2),
        }
    }

    /// Processing delays are drawn from a quarter of `max` up to `max`.
    pub fn with_max_processing_delay(mut self, max: Duration) -> Self {
        self.max_processing_delay = max;
        self
    }

    pub fn plan(&mut self) -> FulfillmentPlan {
        let carrier = Carrier::ALL[self.rng.gen_range(0..Carrier::ALL.len())];
        let max_ms = self.max_processing_delay.as_millis().min(u128::from(u64::MAX)) as u64;

        FulfillmentPlan {
            warehouse_id: WAREHOUSES[self.rng.gen_range(0..WAREHOUSES.len())],
            ship_after_days: self.rng.gen_range(SHIP_AFTER_DAYS),
            carrier,
            tracking_number: tracking_number(carrier, &mut self.rng),
            delivery_after_days: self.rng.gen_range(DELIVERY_AFTER_DAYS),
            processing_delay: Duration::from_millis(self.rng.gen_range(max_ms / 4..=max_ms)),
        }
    }
}
