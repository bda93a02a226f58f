//! Lightweight runtime metrics aggregation for scan sessions

use crate::config::MetricsFormat;
use crate::error::{Error, Result};
use crate::pump::PumpOutcome;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

static METRICS: OnceLock<Arc<MetricsInner>> = OnceLock::new();
static LAST_SNAPSHOT: OnceLock<Mutex<Option<Snapshot>>> = OnceLock::new();

/// Enable periodic metrics emission with the provided interval in seconds.
pub fn enable(interval_secs: u64) {
    let interval = interval_secs.max(5);
    let inner = Arc::clone(METRICS.get_or_init(|| Arc::new(MetricsInner::new(interval))));
    inner.update_interval(interval);
    inner.ensure_task();
}

/// Record what the decode pump did with one sampled frame.
pub fn record_frame(duration: Duration, outcome: &PumpOutcome, device_id: &str) {
    if let Some(inner) = METRICS.get() {
        inner.with_state(|state| state.record_frame(duration, outcome, device_id));
    }
}

/// Record the observed interval between successive frame samples.
pub fn record_frame_interval(interval: Duration) {
    if let Some(inner) = METRICS.get() {
        inner.with_state(|state| state.record_frame_interval(interval));
    }
}

/// Record the outcome of a camera switch.
pub fn record_switch(success: bool) {
    if let Some(inner) = METRICS.get() {
        inner.with_state(|state| {
            if success {
                state.switches += 1;
            } else {
                state.switch_failures += 1;
            }
        });
    }
}

/// Record a failed stream open.
pub fn record_media_error() {
    if let Some(inner) = METRICS.get() {
        inner.with_state(|state| state.media_errors += 1);
    }
}

/// Record a failed frame capture on an open stream.
pub fn record_capture_error() {
    if let Some(inner) = METRICS.get() {
        inner.with_state(|state| state.capture_errors += 1);
    }
}

/// Spawn a lightweight HTTP endpoint that exposes the latest metrics snapshot.
pub fn spawn_http_endpoint(addr: SocketAddr, format: MetricsFormat) -> Result<()> {
    let std_listener = std::net::TcpListener::bind(addr).map_err(Error::Io)?;
    std_listener.set_nonblocking(true).map_err(Error::Io)?;
    let listener = TcpListener::from_std(std_listener).map_err(Error::Io)?;

    tokio::spawn(async move {
        if let Err(err) = run_http_listener(listener, format).await {
            tracing::error!(target: "ticketscan::metrics", error = %err, "metrics endpoint error");
        }
    });

    Ok(())
}

struct MetricsInner {
    state: Mutex<MetricsState>,
    interval_secs: AtomicU64,
    task_spawned: AtomicBool,
}

impl MetricsInner {
    fn new(interval_secs: u64) -> Self {
        Self {
            state: Mutex::new(MetricsState::new()),
            interval_secs: AtomicU64::new(interval_secs.max(5)),
            task_spawned: AtomicBool::new(false),
        }
    }

    fn update_interval(&self, interval_secs: u64) {
        self.interval_secs
            .store(interval_secs.max(5), Ordering::Relaxed);
    }

    fn ensure_task(self: &Arc<Self>) {
        if self
            .task_spawned
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let runner = Arc::clone(self);
            tokio::spawn(async move {
                runner.run().await;
            });
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_state(&self, f: impl FnOnce(&mut MetricsState)) {
        f(&mut self.lock());
    }

    fn snapshot_current(&self) -> Snapshot {
        self.lock().snapshot()
    }

    async fn run(self: Arc<Self>) {
        let mut current_secs = self.interval_secs.load(Ordering::Relaxed).max(5);
        loop {
            let mut ticker = time::interval(Duration::from_secs(current_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Align the ticker so the first report happens after a full interval
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let snapshot = {
                    let mut state = self.lock();
                    let snapshot = state.snapshot();
                    state.reset_window();
                    snapshot
                };
                store_snapshot(&snapshot);
                log_snapshot(&snapshot);

                let next_secs = self.interval_secs.load(Ordering::Relaxed).max(5);
                if next_secs != current_secs {
                    current_secs = next_secs;
                    break;
                }
            }
        }
    }
}

#[derive(Default)]
struct DeviceCounters {
    frames: u64,
    accepted: u64,
}

struct MetricsState {
    frames: u64,
    accepted: u64,
    suppressed: u64,
    no_result: u64,
    decode_time: Duration,
    switches: u64,
    switch_failures: u64,
    media_errors: u64,
    capture_errors: u64,
    per_device: HashMap<String, DeviceCounters>,
    last_reset: Instant,
    frame_interval_total: Duration,
    frame_interval_samples: u32,
    frame_interval_max: Duration,
}

impl MetricsState {
    fn new() -> Self {
        Self {
            frames: 0,
            accepted: 0,
            suppressed: 0,
            no_result: 0,
            decode_time: Duration::ZERO,
            switches: 0,
            switch_failures: 0,
            media_errors: 0,
            capture_errors: 0,
            per_device: HashMap::new(),
            last_reset: Instant::now(),
            frame_interval_total: Duration::ZERO,
            frame_interval_samples: 0,
            frame_interval_max: Duration::ZERO,
        }
    }

    fn record_frame(&mut self, duration: Duration, outcome: &PumpOutcome, device_id: &str) {
        self.frames += 1;
        self.decode_time += duration;
        let device = self.per_device.entry(device_id.to_string()).or_default();
        device.frames += 1;
        match outcome {
            PumpOutcome::Accepted(_) => {
                self.accepted += 1;
                device.accepted += 1;
            }
            PumpOutcome::Suppressed => self.suppressed += 1,
            PumpOutcome::NoResult => self.no_result += 1,
        }
    }

    fn record_frame_interval(&mut self, interval: Duration) {
        self.frame_interval_total += interval;
        self.frame_interval_samples = self.frame_interval_samples.saturating_add(1);
        self.frame_interval_max = self.frame_interval_max.max(interval);
    }

    fn snapshot(&self) -> Snapshot {
        let mut per_device: Vec<DeviceSnapshot> = self
            .per_device
            .iter()
            .map(|(device_id, counters)| DeviceSnapshot {
                device_id: device_id.clone(),
                frames: counters.frames,
                accepted: counters.accepted,
            })
            .collect();
        per_device.sort_by(|a, b| a.device_id.cmp(&b.device_id));

        Snapshot {
            elapsed: self.last_reset.elapsed(),
            frames: self.frames,
            accepted: self.accepted,
            suppressed: self.suppressed,
            no_result: self.no_result,
            decode_time: self.decode_time,
            switches: self.switches,
            switch_failures: self.switch_failures,
            media_errors: self.media_errors,
            capture_errors: self.capture_errors,
            frame_interval_avg: self
                .frame_interval_total
                .checked_div(self.frame_interval_samples),
            frame_interval_max: (self.frame_interval_samples > 0)
                .then_some(self.frame_interval_max),
            per_device,
        }
    }

    fn reset_window(&mut self) {
        *self = Self::new();
    }
}

#[derive(Clone)]
struct Snapshot {
    elapsed: Duration,
    frames: u64,
    accepted: u64,
    suppressed: u64,
    no_result: u64,
    decode_time: Duration,
    switches: u64,
    switch_failures: u64,
    media_errors: u64,
    capture_errors: u64,
    frame_interval_avg: Option<Duration>,
    frame_interval_max: Option<Duration>,
    per_device: Vec<DeviceSnapshot>,
}

impl Snapshot {
    fn avg_decode_ms(&self) -> f64 {
        if self.frames == 0 {
            0.0
        } else {
            self.decode_time.as_secs_f64() * 1_000.0 / self.frames as f64
        }
    }
}

#[derive(Clone)]
struct DeviceSnapshot {
    device_id: String,
    frames: u64,
    accepted: u64,
}

fn log_snapshot(snapshot: &Snapshot) {
    info!(
        target: "ticketscan::metrics",
        interval_secs = snapshot.elapsed.as_secs(),
        frames = snapshot.frames,
        accepted = snapshot.accepted,
        suppressed = snapshot.suppressed,
        no_result = snapshot.no_result,
        avg_decode_ms = snapshot.avg_decode_ms(),
        switches = snapshot.switches,
        switch_failures = snapshot.switch_failures,
        media_errors = snapshot.media_errors,
        capture_errors = snapshot.capture_errors,
        frame_interval_avg_ms = snapshot.frame_interval_avg.map(|d| d.as_secs_f64() * 1_000.0),
        frame_interval_max_ms = snapshot.frame_interval_max.map(|d| d.as_secs_f64() * 1_000.0),
        "Scan metrics window"
    );

    if !snapshot.per_device.is_empty() {
        let breakdown = snapshot
            .per_device
            .iter()
            .map(|d| format!("{}: {} frames / {} accepted", d.device_id, d.frames, d.accepted))
            .collect::<Vec<_>>()
            .join(", ");
        info!(target: "ticketscan::metrics", breakdown, "Per-device metrics");
    }
}

fn store_snapshot(snapshot: &Snapshot) {
    let lock = LAST_SNAPSHOT.get_or_init(|| Mutex::new(None));
    if let Ok(mut guard) = lock.lock() {
        *guard = Some(snapshot.clone());
    }
}

fn latest_snapshot() -> Option<Snapshot> {
    let lock = LAST_SNAPSHOT.get_or_init(|| Mutex::new(None));
    match lock.lock() {
        Ok(guard) => (*guard).clone(),
        Err(_) => None,
    }
}

async fn run_http_listener(listener: TcpListener, format: MetricsFormat) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(target: "ticketscan::metrics", error = %err, "metrics accept failed");
                time::sleep(Duration::from_millis(250)).await;
                continue;
            }
        };

        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, format).await {
                tracing::debug!(target: "ticketscan::metrics", peer = %peer, error = %err, "metrics connection closed");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, format: MetricsFormat) -> Result<()> {
    let mut buffer = [0u8; 1024];
    let _ = stream.read(&mut buffer).await.map_err(Error::Io)?;

    // Before the first window closes, serve the live counters instead.
    let snapshot = latest_snapshot().or_else(|| METRICS.get().map(|m| m.snapshot_current()));

    let (status_line, content_type, body) = match snapshot {
        Some(snapshot) => match format {
            MetricsFormat::Json => {
                let body = serde_json::to_vec(&snapshot_to_http(&snapshot))?;
                ("HTTP/1.1 200 OK\r\n", Some("application/json"), body)
            }
            MetricsFormat::Prometheus => (
                "HTTP/1.1 200 OK\r\n",
                Some("text/plain; version=0.0.4"),
                render_prometheus(&snapshot).into_bytes(),
            ),
        },
        None => ("HTTP/1.1 204 No Content\r\n", None, Vec::new()),
    };

    let mut response = Vec::with_capacity(128 + body.len());
    response.extend_from_slice(status_line.as_bytes());
    response.extend_from_slice(b"Connection: close\r\n");
    response.extend_from_slice(b"Cache-Control: no-store\r\n");
    if let Some(content_type) = content_type {
        response.extend_from_slice(b"Content-Type: ");
        response.extend_from_slice(content_type.as_bytes());
        response.extend_from_slice(b"\r\n");
    }
    let length_header = format!("Content-Length: {}\r\n\r\n", body.len());
    response.extend_from_slice(length_header.as_bytes());
    response.extend_from_slice(&body);

    stream.write_all(&response).await.map_err(Error::Io)?;
    stream.shutdown().await.map_err(Error::Io)?;

    Ok(())
}

#[derive(Serialize)]
struct HttpMetrics {
    window_secs: u64,
    frames: FrameMetrics,
    switches: SwitchMetrics,
    media_errors: u64,
    capture_errors: u64,
    frame_intervals: Option<FrameIntervalMetrics>,
    per_device: Vec<HttpDeviceMetrics>,
}

#[derive(Serialize)]
struct FrameMetrics {
    total: u64,
    accepted: u64,
    suppressed: u64,
    no_result: u64,
    avg_decode_ms: f64,
}

#[derive(Serialize)]
struct SwitchMetrics {
    ok: u64,
    failed: u64,
}

#[derive(Serialize)]
struct FrameIntervalMetrics {
    avg_ms: f64,
    max_ms: f64,
}

#[derive(Serialize)]
struct HttpDeviceMetrics {
    device_id: String,
    frames: u64,
    accepted: u64,
}

fn snapshot_to_http(snapshot: &Snapshot) -> HttpMetrics {
    HttpMetrics {
        window_secs: snapshot.elapsed.as_secs(),
        frames: FrameMetrics {
            total: snapshot.frames,
            accepted: snapshot.accepted,
            suppressed: snapshot.suppressed,
            no_result: snapshot.no_result,
            avg_decode_ms: snapshot.avg_decode_ms(),
        },
        switches: SwitchMetrics {
            ok: snapshot.switches,
            failed: snapshot.switch_failures,
        },
        media_errors: snapshot.media_errors,
        capture_errors: snapshot.capture_errors,
        frame_intervals: snapshot.frame_interval_avg.map(|avg| FrameIntervalMetrics {
            avg_ms: avg.as_secs_f64() * 1_000.0,
            max_ms: snapshot.frame_interval_max.unwrap_or(avg).as_secs_f64() * 1_000.0,
        }),
        per_device: snapshot
            .per_device
            .iter()
            .map(|d| HttpDeviceMetrics {
                device_id: d.device_id.clone(),
                frames: d.frames,
                accepted: d.accepted,
            })
            .collect(),
    }
}

/// One Prometheus metric family: HELP and TYPE once, then its samples.
struct Family<'a> {
    out: &'a mut String,
    name: &'static str,
}

impl<'a> Family<'a> {
    fn new(out: &'a mut String, name: &'static str, kind: &str, help: &str) -> Self {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} {kind}");
        Self { out, name }
    }

    fn value(self, value: impl std::fmt::Display) {
        let _ = writeln!(self.out, "{} {value}", self.name);
    }

    fn labelled(&mut self, key: &str, label: &str, value: impl std::fmt::Display) -> &mut Self {
        let _ = writeln!(
            self.out,
            "{}{{{key}=\"{}\"}} {value}",
            self.name,
            escape_label(label)
        );
        self
    }
}

fn render_prometheus(snapshot: &Snapshot) -> String {
    let mut out = String::new();

    Family::new(
        &mut out,
        "ticketscan_window_seconds",
        "gauge",
        "Duration of the aggregation window in seconds",
    )
    .value(snapshot.elapsed.as_secs());

    Family::new(
        &mut out,
        "ticketscan_frames_total",
        "counter",
        "Frames sampled during the window by outcome",
    )
    .labelled("outcome", "accepted", snapshot.accepted)
    .labelled("outcome", "suppressed", snapshot.suppressed)
    .labelled("outcome", "no_result", snapshot.no_result);

    Family::new(
        &mut out,
        "ticketscan_decode_avg_seconds",
        "gauge",
        "Average time spent capturing and decoding a frame",
    )
    .value(format_args!("{:.6}", snapshot.avg_decode_ms() / 1_000.0));

    Family::new(
        &mut out,
        "ticketscan_switches_total",
        "counter",
        "Camera switches by result",
    )
    .labelled("result", "success", snapshot.switches)
    .labelled("result", "failure", snapshot.switch_failures);

    Family::new(
        &mut out,
        "ticketscan_media_errors_total",
        "counter",
        "Stream opens refused by the host",
    )
    .value(snapshot.media_errors);

    Family::new(
        &mut out,
        "ticketscan_capture_errors_total",
        "counter",
        "Frame captures that failed on an open stream",
    )
    .value(snapshot.capture_errors);

    if let (Some(avg), Some(max)) = (snapshot.frame_interval_avg, snapshot.frame_interval_max) {
        Family::new(
            &mut out,
            "ticketscan_frame_interval_seconds",
            "gauge",
            "Time between frame samples",
        )
        .labelled("stat", "avg", format_args!("{:.6}", avg.as_secs_f64()))
        .labelled("stat", "max", format_args!("{:.6}", max.as_secs_f64()));
    }

    if !snapshot.per_device.is_empty() {
        let mut family = Family::new(
            &mut out,
            "ticketscan_device_scans_total",
            "counter",
            "Accepted scans by camera",
        );
        for entry in &snapshot.per_device {
            family.labelled("device", &entry.device_id, entry.accepted);
        }
    }

    out
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_counts_outcomes() {
        let mut state = MetricsState::new();
        state.record_frame(Duration::from_millis(4), &PumpOutcome::NoResult, "d1");
        state.record_frame(Duration::from_millis(6), &PumpOutcome::Suppressed, "d1");
        state.record_frame_interval(Duration::from_millis(300));
        state.record_frame_interval(Duration::from_millis(500));

        let snapshot = state.snapshot();
        assert_eq!(snapshot.frames, 2);
        assert_eq!(snapshot.suppressed, 1);
        assert_eq!(snapshot.no_result, 1);
        assert_eq!(snapshot.frame_interval_avg, Some(Duration::from_millis(400)));
        assert_eq!(snapshot.frame_interval_max, Some(Duration::from_millis(500)));
        assert!((snapshot.avg_decode_ms() - 5.0).abs() < 1e-9);

        state.reset_window();
        assert_eq!(state.snapshot().frames, 0);
        assert_eq!(state.snapshot().frame_interval_avg, None);
    }

    #[test]
    fn test_prometheus_labels_are_escaped() {
        let mut state = MetricsState::new();
        state.record_frame(Duration::ZERO, &PumpOutcome::NoResult, "cam\"1");
        let text = render_prometheus(&state.snapshot());
        assert!(text.contains("device=\"cam\\\"1\""));
        assert!(text.contains("ticketscan_frames_total{outcome=\"no_result\"} 1"));
    }
}
