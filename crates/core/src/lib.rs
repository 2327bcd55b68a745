//! Identifiers and error primitives shared by every orderflow crate.
//!
//! This crate has no I/O and no async; it only names things.

pub mod error;
pub mod id;

pub use error::{CoreError, CoreResult};
pub use id::{DeadLetterId, MessageId, Offset, PartitionId};
