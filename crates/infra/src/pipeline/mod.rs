//! The bridge pipeline: partition workers that relay validated records from
//! a [`LogSource`](crate::source::LogSource) to a [`QueueSink`](crate::queue::QueueSink).

mod bridge;
mod config;
mod stage;
mod stats;
mod worker;

pub use bridge::{Bridge, BridgeHandle, ShutdownReport};
pub use config::PipelineConfig;
pub use stage::{InvalidTransition, MessageFlow, Stage};
pub use stats::{BridgeStats, PartitionState, PartitionStatus, StatsSnapshot};
pub use worker::{
    BatchOutcome, Disposition, PartitionReport, PartitionWorker, PipelineContext, WorkerError, WorkerExit,
};
