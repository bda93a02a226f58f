use std::io::Result as IoResult;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::time::{Duration, SystemTime};

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use ticketscan::config::MetricsFormat;
use ticketscan::metrics;
use ticketscan::pump::{PumpOutcome, ScanResult, ScanSource};

fn next_free_port() -> IoResult<SocketAddr> {
    let listener = StdTcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(addr)
}

fn accepted(text: &str) -> PumpOutcome {
    PumpOutcome::Accepted(ScanResult {
        text: text.to_string(),
        timestamp: SystemTime::now(),
        source: ScanSource::Camera {
            device_id: "d1".to_string(),
        },
    })
}

async fn fetch(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())
        .await
        .expect("write request");

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.expect("read response");
    String::from_utf8_lossy(&buf).into_owned()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_endpoint_serves_json_metrics() {
    metrics::enable(10);
    metrics::record_frame(Duration::from_millis(12), &accepted("TICKET-42"), "d1");
    metrics::record_frame(Duration::from_millis(9), &PumpOutcome::Suppressed, "d1");
    metrics::record_frame_interval(Duration::from_millis(300));
    metrics::record_switch(true);

    let addr = next_free_port().expect("allocate port");
    metrics::spawn_http_endpoint(addr, MetricsFormat::Json).expect("spawn json endpoint");

    tokio::time::sleep(Duration::from_millis(50)).await;

    let response = fetch(addr, "/").await;
    assert!(
        response.starts_with("HTTP/1.1 200"),
        "unexpected status: {response}"
    );

    let split: Vec<&str> = response.splitn(2, "\r\n\r\n").collect();
    assert_eq!(split.len(), 2, "invalid HTTP response format");
    let payload: Value = serde_json::from_str(split[1]).expect("parse json metrics");

    assert!(payload["frames"]["accepted"].as_u64().unwrap_or_default() >= 1);
    assert!(payload["frames"]["suppressed"].as_u64().unwrap_or_default() >= 1);
    assert!(payload["switches"]["ok"].as_u64().unwrap_or_default() >= 1);

    let per_device = payload["per_device"].as_array().expect("per_device array");
    assert!(
        per_device.iter().any(|entry| entry["device_id"] == "d1"),
        "expected d1 device metrics"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_endpoint_serves_prometheus_metrics() {
    metrics::enable(10);
    metrics::record_frame(Duration::from_millis(7), &PumpOutcome::NoResult, "d2");
    metrics::record_media_error();

    let addr = next_free_port().expect("allocate port");
    metrics::spawn_http_endpoint(addr, MetricsFormat::Prometheus).expect("spawn prom endpoint");

    tokio::time::sleep(Duration::from_millis(50)).await;

    let response = fetch(addr, "/metrics").await;
    assert!(
        response.starts_with("HTTP/1.1 200"),
        "unexpected status: {response}"
    );
    assert!(
        response.contains("ticketscan_frames_total{outcome=\"no_result\"}"),
        "missing frame counters"
    );
    assert!(
        response.contains("ticketscan_media_errors_total"),
        "missing media error counter"
    );
}
