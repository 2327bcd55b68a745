//! Order lifecycle events.
//!
//! ```text
//! OrderCreated --> OrderAccepted --> OrderShipped --> OrderFulfilled
//! ```
//!
//! The producer emits `OrderCreated`; [`Fulfillment`] plans the rest.
//!
//! Amounts travel as two-place decimal strings (`"79.99"`); timestamps as
//! ISO-8601, with or without an offset (naive values are UTC).

mod fulfillment;
mod generator;

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::schema::{EventSchema, FieldKind};

pub use fulfillment::{
    DELIVERY_AFTER_DAYS, FULFILLMENT_SOURCE, Fulfillment, FulfillmentPlan, SHIP_AFTER_DAYS, WAREHOUSES, tracking_number,
};
pub use generator::{CATALOG, OrderGenerator};

/// `source` header written by the order producer.
pub const ORDER_PRODUCER_SOURCE: &str = "order-producer";

/// Money amount with two decimal places, stored as cents.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub fn cents(&self) -> i64 {
        self.0
    }

    pub fn times(&self, quantity: u32) -> Amount {
        Amount(self.0 * i64::from(quantity))
    }
}

impl core::ops::Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl core::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, |acc, a| acc + a)
    }
}

impl core::fmt::Display for Amount {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl core::str::FromStr for Amount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
        if int_part.is_empty()
            || !int_part.bytes().all(|b| b.is_ascii_digit())
            || frac_part.len() > 2
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
            || (digits.contains('.') && frac_part.is_empty())
        {
            return Err(format!("invalid amount `{s}`"));
        }
        let units: i64 = int_part.parse().map_err(|_| format!("amount out of range `{s}`"))?;
        let cents: i64 = match frac_part.len() {
            0 => 0,
            1 => frac_part.parse::<i64>().unwrap_or(0) * 10,
            _ => frac_part.parse::<i64>().unwrap_or(0),
        };
        let total = units
            .checked_mul(100)
            .and_then(|v| v.checked_add(cents))
            .ok_or_else(|| format!("amount out of range `{s}`"))?;
        Ok(Amount(if negative { -total } else { total }))
    }
}

impl Serialize for Amount {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(serde_json::Number),
        }

        let text = match Repr::deserialize(deserializer)? {
            Repr::Text(s) => s,
            Repr::Number(n) => n.to_string(),
        };
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Timestamps accepted with or without an offset; written as RFC 3339.
mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

fn default_country() -> String {
    "USA".to_string()
}

/// Shipping or billing address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    #[serde(default = "default_country")]
    pub country: String,
}

/// Individual item in an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: String,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: Amount,
}

impl OrderItem {
    pub fn line_total(&self) -> Amount {
        self.unit_price.times(self.quantity)
    }
}

/// Shipping carrier options.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Carrier {
    Fedex,
    Ups,
    Usps,
    Dhl,
}

impl Carrier {
    pub const ALL: [Carrier; 4] = [Carrier::Fedex, Carrier::Ups, Carrier::Usps, Carrier::Dhl];

    pub fn as_str(&self) -> &'static str {
        match self {
            Carrier::Fedex => "FEDEX",
            Carrier::Ups => "UPS",
            Carrier::Usps => "USPS",
            Carrier::Dhl => "DHL",
        }
    }
}

fn carrier_kind() -> FieldKind {
    FieldKind::one_of(Carrier::ALL.iter().map(Carrier::as_str))
}

/// A new order was placed. Initiates fulfillment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: String,
    pub customer_id: String,
    pub customer_email: String,
    pub items: Vec<OrderItem>,
    pub total_amount: Amount,
    pub shipping_address: Address,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Event for OrderCreated {
    const EVENT_TYPE: &'static str = "OrderCreated";

    fn schema() -> EventSchema {
        EventSchema::new(Self::EVENT_TYPE, Self::SCHEMA_VERSION)
            .required("order_id", FieldKind::String)
            .required("customer_id", FieldKind::String)
            .required("customer_email", FieldKind::String)
            .required("items", FieldKind::Array)
            .required("items[].product_id", FieldKind::String)
            .required("items[].product_name", FieldKind::String)
            .required("items[].quantity", FieldKind::PositiveInteger)
            .required("items[].unit_price", FieldKind::money())
            .required("total_amount", FieldKind::money())
            .required("shipping_address", FieldKind::Object)
            .required("shipping_address.street", FieldKind::String)
            .required("shipping_address.city", FieldKind::String)
            .required("shipping_address.state", FieldKind::String)
            .required("shipping_address.zip_code", FieldKind::String)
            .optional("shipping_address.country", FieldKind::String)
            .required("created_at", FieldKind::Timestamp)
            .optional("metadata", FieldKind::Object)
    }

    fn partition_key(&self) -> &str {
        &self.customer_id
    }

    fn correlation_id(&self) -> &str {
        &self.order_id
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Order validated and queued for fulfillment at a warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAccepted {
    pub order_id: String,
    pub customer_id: String,
    #[serde(with = "timestamp")]
    pub accepted_at: DateTime<Utc>,
    pub estimated_ship_date: NaiveDate,
    pub warehouse_id: String,
}

impl Event for OrderAccepted {
    const EVENT_TYPE: &'static str = "OrderAccepted";

    fn schema() -> EventSchema {
        EventSchema::new(Self::EVENT_TYPE, Self::SCHEMA_VERSION)
            .required("order_id", FieldKind::String)
            .required("customer_id", FieldKind::String)
            .required("accepted_at", FieldKind::Timestamp)
            .required("estimated_ship_date", FieldKind::Date)
            .required("warehouse_id", FieldKind::String)
    }

    fn partition_key(&self) -> &str {
        &self.customer_id
    }

    fn correlation_id(&self) -> &str {
        &self.order_id
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.accepted_at
    }
}

/// Order left the warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderShipped {
    pub order_id: String,
    pub customer_id: String,
    pub tracking_number: String,
    pub carrier: Carrier,
    #[serde(with = "timestamp")]
    pub shipped_at: DateTime<Utc>,
    pub estimated_delivery_date: NaiveDate,
    pub warehouse_id: String,
}

impl Event for OrderShipped {
    const EVENT_TYPE: &'static str = "OrderShipped";

    fn schema() -> EventSchema {
        EventSchema::new(Self::EVENT_TYPE, Self::SCHEMA_VERSION)
            .required("order_id", FieldKind::String)
            .required("customer_id", FieldKind::String)
            .required("tracking_number", FieldKind::String)
            .required("carrier", carrier_kind())
            .required("shipped_at", FieldKind::Timestamp)
            .required("estimated_delivery_date", FieldKind::Date)
            .required("warehouse_id", FieldKind::String)
    }

    fn partition_key(&self) -> &str {
        &self.customer_id
    }

    fn correlation_id(&self) -> &str {
        &self.order_id
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.shipped_at
    }
}

/// Terminal event: the order process is complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFulfilled {
    pub order_id: String,
    pub customer_id: String,
    #[serde(with = "timestamp")]
    pub fulfilled_at: DateTime<Utc>,
    pub tracking_number: String,
    pub carrier: Carrier,
    pub total_amount: Amount,
}

impl Event for OrderFulfilled {
    const EVENT_TYPE: &'static str = "OrderFulfilled";

    fn schema() -> EventSchema {
        EventSchema::new(Self::EVENT_TYPE, Self::SCHEMA_VERSION)
            .required("order_id", FieldKind::String)
            .required("customer_id", FieldKind::String)
            .required("fulfilled_at", FieldKind::Timestamp)
            .required("tracking_number", FieldKind::String)
            .required("carrier", carrier_kind())
            .required("total_amount", FieldKind::money())
    }

    fn partition_key(&self) -> &str {
        &self.customer_id
    }

    fn correlation_id(&self) -> &str {
        &self.order_id
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.fulfilled_at
    }
}

/// Schemas of every order lifecycle event.
pub fn order_schemas() -> Vec<EventSchema> {
    vec![
        OrderCreated::schema(),
        OrderAccepted::schema(),
        OrderShipped::schema(),
        OrderFulfilled::schema(),
    ]
}
