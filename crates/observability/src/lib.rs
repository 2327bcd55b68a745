//! Process-wide logging setup for the bridge.

/// Tracing subscriber configuration (filters, output format).
pub mod tracing;

pub use crate::tracing::{LOG_FORMAT_ENV, LogFormat, UnknownLogFormat};

/// Initialize tracing/logging from `RUST_LOG` and `LOG_FORMAT`.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    crate::tracing::init();
}
