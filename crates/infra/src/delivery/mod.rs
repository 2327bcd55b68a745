//! Delivery tracking: per-message acknowledgment state, retry policy and
//! the commit watermark.

mod record;
mod retry;
mod tracker;

pub use record::{AttemptRecord, DeliveryRecord, DeliveryState, TrackingId};
pub use retry::{Backoff, RetryPolicy};
pub use tracker::{DeliveryTracker, TrackerError};
