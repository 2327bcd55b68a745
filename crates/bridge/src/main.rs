use orderflow_bridge::BridgeConfig;
use orderflow_infra::pipeline::WorkerExit;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    orderflow_observability::init();

    let config = BridgeConfig::from_env()?;
    tracing::info!(
        backend = ?config.backend,
        source = %config.source_stream,
        destination = %config.destination_queue,
        dead_letters = %config.dead_letter_queue,
        "Starting order bridge"
    );

    let report = orderflow_bridge::app::run(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C; shutting down");
        }
    })
    .await?;

    for partition in &report.partitions {
        tracing::info!(
            partition = %partition.partition,
            committed = ?partition.committed,
            uncommitted = partition.uncommitted.len(),
            halted = matches!(partition.exit, WorkerExit::Halted(_)),
            "Partition summary"
        );
    }
    if report.forced {
        tracing::warn!(journaled = report.journaled, "Shutdown forced; in-flight records will be redelivered");
    }

    Ok(())
}
