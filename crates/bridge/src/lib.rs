//! The `orderflow-bridge` service: configuration, adapter wiring and the
//! status API around the infra pipeline.

pub mod app;
pub mod config;
pub mod fulfillment;
pub mod status;

pub use config::{Backend, BridgeConfig, ConfigError};
