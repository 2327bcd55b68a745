//! Wiring: turns a [`BridgeConfig`] into running partition workers, the
//! status server and, with the in-memory backend, the demo order producer and
//! fulfillment stage.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use orderflow_core::PartitionId;
use orderflow_events::orders::{Fulfillment, ORDER_PRODUCER_SOURCE, OrderGenerator};
use orderflow_events::{InMemorySchemaRegistry, SchemaError, SchemaRegistry};
use orderflow_infra::source::partition_for_key;
use orderflow_infra::{
    Bridge, DeadLetterRouter, DeliveryJournal, InMemoryDeliveryJournal, InMemoryLog, InMemoryQueue,
    JournalError, LogSource, PipelineContext, PublishError, QueueSink, ShutdownReport, SourceError,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Backend, BridgeConfig};
use crate::fulfillment::spawn_fulfillment;
use crate::status;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("failed to read schema file {path}: {source}")]
    SchemaFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("backend {0} requires the `{0}` feature")]
    FeatureDisabled(&'static str),
}

/// In-memory ends of the pipeline, where the demo services attach.
pub struct DemoAdapters {
    pub log: Arc<InMemoryLog>,
    pub destination: Arc<InMemoryQueue>,
}

/// Adapters and context for one bridge run.
pub struct Components {
    pub context: PipelineContext,
    pub journal: Arc<dyn DeliveryJournal>,
    /// Present with the in-memory backend.
    pub demo: Option<DemoAdapters>,
}

pub async fn build(config: &BridgeConfig) -> Result<Components, AppError> {
    let registry = schema_registry(config)?;

    let (source, destination, dead_letters, demo): (
        Arc<dyn LogSource>,
        Arc<dyn QueueSink>,
        Arc<dyn QueueSink>,
        Option<DemoAdapters>,
    ) = match config.backend {
        Backend::Memory => {
            let log = Arc::new(InMemoryLog::new(config.source_stream.clone(), config.partitions));
            let destination = Arc::new(InMemoryQueue::new(config.destination_queue.clone()));
            (
                log.clone(),
                destination.clone(),
                Arc::new(InMemoryQueue::new(config.dead_letter_queue.clone())),
                Some(DemoAdapters { log, destination }),
            )
        }
        Backend::Redis => {
            let (source, destination, dead_letters) = redis_adapters(config).await?;
            (source, destination, dead_letters, None)
        }
    };

    info!(
        backend = ?config.backend,
        source = %source.name(),
        destination = %destination.name(),
        dead_letters = %dead_letters.name(),
        partitions = config.partitions,
        "Bridge adapters ready"
    );

    let context = PipelineContext::new(
        source,
        destination,
        DeadLetterRouter::new(dead_letters),
        registry,
        config.pipeline(),
    );

    Ok(Components {
        context,
        journal: journal(config).await?,
        demo,
    })
}

fn schema_registry(config: &BridgeConfig) -> Result<Arc<dyn SchemaRegistry>, AppError> {
    let registry = InMemorySchemaRegistry::with_order_schemas();
    if let Some(path) = &config.schema_file {
        let document = std::fs::read_to_string(path).map_err(|source| AppError::SchemaFile {
            path: path.display().to_string(),
            source,
        })?;
        let loaded = registry.extend_from_json(&document)?;
        info!(path = %path.display(), loaded, "Loaded schemas from file");
    }
    Ok(Arc::new(registry))
}

#[cfg(feature = "redis")]
async fn redis_adapters(
    config: &BridgeConfig,
) -> Result<(Arc<dyn LogSource>, Arc<dyn QueueSink>, Arc<dyn QueueSink>), AppError> {
    use orderflow_infra::queue::RedisStreamsQueue;
    use orderflow_infra::source::RedisStreamsSource;

    let source = RedisStreamsSource::connect(
        &config.redis_url,
        &config.source_stream,
        config.partitions,
        config.consumer_group.clone(),
        config.consumer_name.clone(),
    )
    .await?;
    let destination = RedisStreamsQueue::connect(&config.redis_url, config.destination_queue.clone()).await?;
    let dead_letters = RedisStreamsQueue::connect(&config.redis_url, config.dead_letter_queue.clone()).await?;
    Ok((Arc::new(source), Arc::new(destination), Arc::new(dead_letters)))
}

#[cfg(not(feature = "redis"))]
async fn redis_adapters(
    _config: &BridgeConfig,
) -> Result<(Arc<dyn LogSource>, Arc<dyn QueueSink>, Arc<dyn QueueSink>), AppError> {
    Err(AppError::FeatureDisabled("redis"))
}

#[cfg(feature = "postgres")]
async fn journal(config: &BridgeConfig) -> Result<Arc<dyn DeliveryJournal>, AppError> {
    match &config.database_url {
        Some(url) => {
            let journal = orderflow_infra::journal::PostgresDeliveryJournal::connect(url).await?;
            info!("Using Postgres delivery journal");
            Ok(Arc::new(journal))
        }
        None => Ok(Arc::new(InMemoryDeliveryJournal::new())),
    }
}

#[cfg(not(feature = "postgres"))]
async fn journal(config: &BridgeConfig) -> Result<Arc<dyn DeliveryJournal>, AppError> {
    if config.database_url.is_some() {
        warn!("DATABASE_URL is set but the postgres feature is disabled; journaling in memory");
    }
    Ok(Arc::new(InMemoryDeliveryJournal::new()))
}

/// Append generated `OrderCreated` events to `log` every `interval`,
/// partitioned by customer, until `stop` is cancelled. Returns the count.
pub fn spawn_demo_producer(
    log: Arc<InMemoryLog>,
    partitions: u32,
    interval: Duration,
    stop: CancellationToken,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut generator = OrderGenerator::new();
        let mut ticker = tokio::time::interval(interval);
        let mut published = 0;

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let order = generator.next_order();
            let partition: PartitionId = partition_for_key(&order.customer_id, partitions);
            match log.append_event(partition, &order, ORDER_PRODUCER_SOURCE) {
                Ok(offset) => {
                    published += 1;
                    info!(
                        order_id = %order.order_id,
                        customer_id = %order.customer_id,
                        partition = %partition,
                        offset = %offset,
                        "Published demo order"
                    );
                }
                Err(e) => warn!(partition = %partition, error = %e, "Demo order publish failed"),
            }
        }

        info!(published, "Demo producer stopped");
        published
    })
}

/// Run the bridge until `signal` resolves, then drain and report.
///
/// Everything that can fail is set up before the first worker starts, so an
/// error here never leaves partitions running without a shutdown.
pub async fn run(config: BridgeConfig, signal: impl Future<Output = ()>) -> anyhow::Result<ShutdownReport> {
    let listener = TcpListener::bind(config.status_addr)
        .await
        .with_context(|| format!("failed to bind status address {}", config.status_addr))?;
    let status_addr = listener.local_addr()?;

    let Components { context, journal, demo } = build(&config).await.context("failed to wire bridge components")?;

    let stats = context.stats.clone();
    let status_stop = CancellationToken::new();
    let status_server = tokio::spawn(status::serve(listener, stats, status_stop.clone()));
    info!(addr = %status_addr, "Status API listening");

    let handle = Bridge::new(context).with_journal(journal).start().await;

    let demo_stop = CancellationToken::new();
    let mut demo_tasks = Vec::new();
    if let Some(DemoAdapters { log, destination }) = demo {
        let fulfillment = Fulfillment::new().with_max_processing_delay(config.fulfillment_delay);
        demo_tasks.push((
            "fulfillment",
            spawn_fulfillment(
                destination,
                log.clone(),
                config.partitions,
                fulfillment,
                config.poll_interval,
                demo_stop.clone(),
            ),
        ));
        if let Some(interval) = config.demo_publish_interval {
            demo_tasks.push((
                "producer",
                spawn_demo_producer(log, config.partitions, interval, demo_stop.clone()),
            ));
        }
    }

    signal.await;
    info!("Shutdown requested");

    demo_stop.cancel();
    for (task, handle) in demo_tasks {
        if let Err(e) = handle.await {
            warn!(task, error = %e, "Demo task panicked");
        }
    }

    let report = handle.shutdown().await;

    status_stop.cancel();
    status_server
        .await
        .context("status server panicked")?
        .context("status server failed")?;

    Ok(report)
}
