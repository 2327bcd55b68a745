//! Deterministic order generator for demos and tests.

use std::collections::BTreeMap;

use chrono::Utc;
use uuid::Uuid;

use super::{Address, Amount, OrderCreated, OrderItem};

/// Product catalog: (product id, name, unit price in cents).
pub const CATALOG: [(&str, &str, i64); 10] = [
    ("prod_001", "Wireless Headphones", 7999),
    ("prod_002", "Mechanical Keyboard", 14999),
    ("prod_003", "USB-C Hub", 4999),
    ("prod_004", "4K Monitor", 39999),
    ("prod_005", "Ergonomic Mouse", 6999),
    ("prod_006", "Webcam HD", 8999),
    ("prod_007", "Laptop Stand", 4599),
    ("prod_008", "Cable Management Kit", 2499),
    ("prod_009", "Desk Mat", 3499),
    ("prod_010", "Blue Light Glasses", 2999),
];

const CITIES: [(&str, &str, &str); 4] = [
    ("Austin", "TX", "78701"),
    ("Portland", "OR", "97201"),
    ("Columbus", "OH", "43004"),
    ("Raleigh", "NC", "27601"),
];

const SOURCES: [&str; 4] = ["web", "mobile", "api", "pos"];
const CAMPAIGNS: [Option<&str>; 5] = [
    Some("holiday_sale"),
    Some("summer_promo"),
    Some("new_customer"),
    Some("loyalty_reward"),
    None,
];

/// Produces a varied but reproducible stream of `OrderCreated` events.
///
/// Identifiers are random (UUIDv7); everything else is derived from a
/// sequence counter.
#[derive(Debug, Default)]
pub struct OrderGenerator {
    sequence: u64,
}

impl OrderGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generated(&self) -> u64 {
        self.sequence
    }

    pub fn next_order(&mut self) -> OrderCreated {
        let n = self.sequence;
        self.sequence += 1;

        let item_count = 1 + (n % 4) as usize;
        let items: Vec<OrderItem> = (0..item_count)
            .map(|i| {
                let (product_id, product_name, cents) = CATALOG[((n * 7) as usize + i * 3) % CATALOG.len()];
                OrderItem {
                    product_id: product_id.to_string(),
                    product_name: product_name.to_string(),
                    quantity: 1 + ((n as usize + i) % 3) as u32,
                    unit_price: Amount::from_cents(cents),
                }
            })
            .collect();
        let total_amount = items.iter().map(OrderItem::line_total).sum();

        let (city, state, zip_code) = CITIES[(n % CITIES.len() as u64) as usize];
        let mut metadata = BTreeMap::new();
        metadata.insert("source".to_string(), SOURCES[(n % 4) as usize].to_string());
        if let Some(campaign) = CAMPAIGNS[(n % 5) as usize] {
            metadata.insert("campaign".to_string(), campaign.to_string());
        }

        let order_hex = Uuid::now_v7().simple().to_string();
        let customer_hex = Uuid::now_v7().simple().to_string();

        OrderCreated {
            order_id: format!("ord_{}", &order_hex[20..]),
            customer_id: format!("cust_{}", &customer_hex[24..]),
            customer_email: format!("customer{n}@example.com"),
            items,
            total_amount,
            shipping_address: Address {
                street: format!("{} Main St", 100 + n % 900),
                city: city.to_string(),
                state: state.to_string(),
                zip_code: zip_code.to_string(),
                country: "USA".to_string(),
            },
            created_at: Utc::now(),
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, to_record};
    use crate::schema::InMemorySchemaRegistry;
    use crate::validator::Validator;
    use orderflow_core::{Offset, PartitionId};

    #[test]
    fn generated_totals_match_line_items() {
        let mut generator = OrderGenerator::new();
        for _ in 0..20 {
            let order = generator.next_order();
            let expected: Amount = order.items.iter().map(|i| i.unit_price.times(i.quantity)).sum();
            assert_eq!(order.total_amount, expected);
            assert!(!order.items.is_empty() && order.items.len() <= 4);
        }
        assert_eq!(generator.generated(), 20);
    }

    #[test]
    fn generated_orders_pass_validation() {
        let validator = Validator::new(InMemorySchemaRegistry::with_order_schemas());
        let mut generator = OrderGenerator::new();
        for n in 0..12 {
            let order = generator.next_order();
            let rec = to_record(&order, PartitionId::new(0), Offset::new(n), "test").unwrap();
            let env = validator.validate(&rec).unwrap();
            assert_eq!(env.event_type(), OrderCreated::EVENT_TYPE);
        }
    }
}
