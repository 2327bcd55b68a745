use std::sync::Arc;
use std::time::Duration;

use orderflow_bridge::{Backend, BridgeConfig};
use orderflow_core::{Offset, PartitionId};
use orderflow_infra::BridgeStats;
use orderflow_infra::pipeline::PartitionState;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

struct TestServer {
    base_url: String,
    stop: CancellationToken,
    handle: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    async fn spawn(stats: Arc<BridgeStats>) -> Self {
        // Same router as the binary, on an ephemeral port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let stop = CancellationToken::new();
        let handle = tokio::spawn(orderflow_bridge::status::serve(listener, stats, stop.clone()));

        Self {
            base_url: format!("http://{addr}"),
            stop,
            handle,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.cancel();
        self.handle.abort();
    }
}

#[tokio::test]
async fn healthz_is_ok_while_partitions_run() {
    let stats = Arc::new(BridgeStats::new());
    stats.update_partition(PartitionId::new(0), |s| s.state = PartitionState::Running);
    let server = TestServer::spawn(stats).await;

    let res = reqwest::get(format!("{}/healthz", server.base_url)).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn healthz_reports_halted_partitions() {
    let stats = Arc::new(BridgeStats::new());
    stats.update_partition(PartitionId::new(0), |s| s.state = PartitionState::Running);
    stats.update_partition(PartitionId::new(1), |s| {
        s.state = PartitionState::Halted;
        s.last_error = Some("dead-letter queue unavailable".to_string());
    });
    let server = TestServer::spawn(stats).await;

    let res = reqwest::get(format!("{}/healthz", server.base_url)).await.unwrap();

    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "halted");
    assert_eq!(body["partitions"], serde_json::json!(["1"]));
}

#[tokio::test]
async fn stats_exposes_counters_and_partition_state() {
    let stats = Arc::new(BridgeStats::new());
    stats.record_received(3);
    stats.record_delivered();
    stats.record_delivered();
    stats.record_validation_failure();
    stats.record_dead_lettered();
    stats.update_partition(PartitionId::new(0), |s| {
        s.state = PartitionState::Running;
        s.committed = Some(Offset::new(2));
    });
    let server = TestServer::spawn(stats).await;

    let body: serde_json::Value = reqwest::get(format!("{}/stats", server.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["received"], 3);
    assert_eq!(body["delivered"], 2);
    assert_eq!(body["dead_lettered"], 1);
    assert_eq!(body["validation_failures"], 1);
    assert_eq!(body["partitions"]["0"]["state"], "running");
    assert_eq!(body["partitions"]["0"]["committed"], 2);
}

#[tokio::test]
async fn demo_backend_delivers_and_drains_on_signal() {
    let config = BridgeConfig {
        backend: Backend::Memory,
        partitions: 2,
        poll_interval: Duration::from_millis(5),
        demo_publish_interval: Some(Duration::from_millis(5)),
        fulfillment_delay: Duration::from_millis(10),
        drain_timeout: Duration::from_secs(2),
        status_addr: "127.0.0.1:0".parse().unwrap(),
        ..BridgeConfig::default()
    };
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let run = tokio::spawn(orderflow_bridge::app::run(config, async {
        let _ = rx.await;
    }));

    tokio::time::sleep(Duration::from_millis(300)).await;
    tx.send(()).unwrap();
    let report = run.await.unwrap().unwrap();

    assert!(!report.forced);
    assert_eq!(report.partitions.len(), 2);
    assert!(report.partitions.iter().any(|p| p.committed.is_some()));
}

#[tokio::test]
async fn status_port_in_use_fails_before_any_adapter_is_wired() {
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = BridgeConfig {
        backend: Backend::Redis,
        redis_url: "redis://127.0.0.1:1".to_string(),
        status_addr: taken.local_addr().unwrap(),
        ..BridgeConfig::default()
    };

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        orderflow_bridge::app::run(config, std::future::pending()),
    )
    .await
    .expect("run must fail without waiting for a shutdown signal");

    let err = result.unwrap_err();
    assert!(err.to_string().contains("failed to bind status address"), "{err:#}");
}
