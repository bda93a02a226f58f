use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use ticketscan::camera::DeviceInfo;
use ticketscan::simulator::MediaEvent;
use ticketscan::{
    ScanResult, ScanSession, ScanSource, SessionHandle, SessionOptions, SessionState,
    SessionStatus, SimulatedMediaDevices,
};

const WAIT: Duration = Duration::from_secs(3);

fn simulator(labels: &[(&str, &str)]) -> Arc<SimulatedMediaDevices> {
    Arc::new(SimulatedMediaDevices::new(
        labels
            .iter()
            .map(|(id, label)| DeviceInfo::video(*id, *label))
            .collect(),
    ))
}

fn back_and_front() -> Arc<SimulatedMediaDevices> {
    simulator(&[("d1", "Back Camera"), ("d2", "Front Camera")])
}

fn start(sim: &Arc<SimulatedMediaDevices>) -> (SessionHandle, mpsc::UnboundedReceiver<ScanResult>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let options = SessionOptions {
        sample_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let session = ScanSession::new(sim.clone(), options, move |scan| {
        let _ = tx.send(scan);
    });
    (session.spawn(), rx)
}

async fn wait_until(handle: &SessionHandle, predicate: impl FnMut(&SessionStatus) -> bool) -> SessionStatus {
    timeout(WAIT, handle.wait_for(predicate))
        .await
        .expect("timed out waiting for session status")
        .expect("session ended early")
}

async fn active_on(handle: &SessionHandle, device: &str) -> SessionStatus {
    wait_until(handle, |s| {
        s.state == SessionState::Active
            && s.active_device.as_ref().is_some_and(|d| d.id == device)
    })
    .await
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

async fn next_scan(rx: &mut mpsc::UnboundedReceiver<ScanResult>) -> ScanResult {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for scan")
        .expect("scan channel closed")
}

fn position(events: &[MediaEvent], wanted: impl Fn(&MediaEvent) -> bool) -> usize {
    events
        .iter()
        .position(wanted)
        .unwrap_or_else(|| panic!("event not found in {events:?}"))
}

#[tokio::test]
async fn check_in_scenario_switch_scan_and_leave() {
    let sim = back_and_front();
    let (handle, mut scans) = start(&sim);

    let status = active_on(&handle, "d1").await;
    assert_eq!(status.device_count, 2);
    assert!(status.can_switch());

    handle.request_switch().unwrap();
    active_on(&handle, "d2").await;

    let events = sim.events();
    let stopped_d1 = position(&events, |e| {
        matches!(e, MediaEvent::Stopped { device, .. } if device == "d1")
    });
    let requested_d2 = position(&events, |e| {
        matches!(e, MediaEvent::OpenRequested { device } if device == "d2")
    });
    assert!(stopped_d1 < requested_d2, "d1 must be released before d2 is requested");

    sim.push_text("d2", "TICKET-42");
    sim.push_text("d2", "TICKET-42");

    let scan = next_scan(&mut scans).await;
    assert_eq!(scan.text, "TICKET-42");
    assert_eq!(
        scan.source,
        ScanSource::Camera {
            device_id: "d2".to_string()
        }
    );

    eventually(|| sim.pending_frames("d2") == 0).await;
    sleep(Duration::from_millis(50)).await;
    assert!(scans.try_recv().is_err(), "second frame must be suppressed");
    assert!(handle.status().suppressed);

    let last = handle.stop().await.unwrap();
    assert_eq!(last.state, SessionState::Stopped);
    assert_eq!(sim.live_tracks(), 0);
    assert_eq!(sim.peak_live_streams(), 1);
}

#[tokio::test]
async fn reset_allows_the_same_code_again() {
    let sim = back_and_front();
    let (handle, mut scans) = start(&sim);
    active_on(&handle, "d1").await;

    sim.push_text("d1", "TICKET-42");
    assert_eq!(next_scan(&mut scans).await.text, "TICKET-42");

    handle.reset().unwrap();
    wait_until(&handle, |s| !s.suppressed).await;

    sim.push_text("d1", "TICKET-42");
    assert_eq!(next_scan(&mut scans).await.text, "TICKET-42");

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn manual_codes_share_suppression() {
    let sim = back_and_front();
    let (handle, mut scans) = start(&sim);
    active_on(&handle, "d1").await;

    handle.submit("TICKET-7").unwrap();
    let scan = next_scan(&mut scans).await;
    assert_eq!(scan.source, ScanSource::Manual);

    handle.submit("TICKET-7").unwrap();
    handle.reset().unwrap();
    handle.submit("TICKET-8").unwrap();
    assert_eq!(next_scan(&mut scans).await.text, "TICKET-8");

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn next_camera_wraps_around() {
    let sim = simulator(&[
        ("d1", "Front Camera"),
        ("d2", "Back Camera"),
        ("d3", "USB Webcam"),
    ]);
    let (handle, _scans) = start(&sim);

    // Back camera is preferred even though it was enumerated second.
    active_on(&handle, "d2").await;

    for expected in ["d3", "d1", "d2"] {
        handle.request_switch().unwrap();
        active_on(&handle, expected).await;
        assert_eq!(sim.live_tracks(), 1);
    }

    handle.stop().await.unwrap();
    assert_eq!(sim.peak_live_streams(), 1);
    assert_eq!(sim.live_tracks(), 0);
}

#[tokio::test]
async fn rapid_switches_never_overlap_streams() {
    let sim = simulator(&[
        ("d1", "Back Camera"),
        ("d2", "Front Camera"),
        ("d3", "USB Webcam"),
    ]);
    let (handle, mut scans) = start(&sim);
    active_on(&handle, "d1").await;

    for _ in 0..10 {
        handle.request_switch().unwrap();
    }
    handle.submit("SENTINEL").unwrap();
    next_scan(&mut scans).await;

    handle.stop().await.unwrap();
    assert_eq!(sim.peak_live_streams(), 1);
    assert_eq!(sim.live_tracks(), 0);
    assert!(
        !sim.events()
            .iter()
            .any(|e| matches!(e, MediaEvent::Dropped { .. })),
        "every stream must be stopped explicitly"
    );
}

#[tokio::test]
async fn switch_requests_during_a_switch_are_rejected() {
    let sim = simulator(&[
        ("d1", "Back Camera"),
        ("d2", "Front Camera"),
        ("d3", "USB Webcam"),
    ]);
    let (handle, mut scans) = start(&sim);
    active_on(&handle, "d1").await;

    sim.hold_opens();
    handle.request_switch().unwrap();
    wait_until(&handle, |s| s.state == SessionState::Switching).await;
    eventually(|| sim.open_requests() == 2).await;

    handle.request_switch().unwrap();
    handle.request_switch_to(2).unwrap();
    handle.submit("QUEUED").unwrap();
    sim.release_opens();

    active_on(&handle, "d2").await;
    assert_eq!(next_scan(&mut scans).await.text, "QUEUED");
    assert_eq!(sim.open_requests(), 2);
    assert_eq!(handle.status().active_device.unwrap().id, "d2");

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn single_camera_offers_no_switch() {
    let sim = simulator(&[("d1", "Integrated Webcam")]);
    let (handle, mut scans) = start(&sim);

    let status = active_on(&handle, "d1").await;
    assert!(!status.can_switch());

    handle.request_switch().unwrap();
    handle.submit("SENTINEL").unwrap();
    next_scan(&mut scans).await;

    assert_eq!(sim.open_requests(), 1);
    assert_eq!(handle.status().active_device.unwrap().id, "d1");
    handle.stop().await.unwrap();
    assert_eq!(sim.live_tracks(), 0);
}

#[tokio::test]
async fn no_cameras_fails_without_opening() {
    let sim = simulator(&[]);
    let (handle, _scans) = start(&sim);

    let status = wait_until(&handle, |s| s.state == SessionState::Failed).await;
    assert_eq!(status.device_count, 0);
    assert!(status.message.is_some());
    assert!(!status.can_switch());

    handle.request_switch().unwrap();
    let last = handle.stop().await.unwrap();
    assert_eq!(last.state, SessionState::Stopped);
    assert_eq!(sim.open_requests(), 0);
}

#[tokio::test]
async fn teardown_during_switch_releases_everything() {
    let sim = back_and_front();
    let (handle, _scans) = start(&sim);
    active_on(&handle, "d1").await;

    sim.hold_opens();
    handle.request_switch().unwrap();
    wait_until(&handle, |s| s.state == SessionState::Switching).await;
    eventually(|| sim.open_requests() == 2).await;

    let last = handle.stop().await.unwrap();
    assert_eq!(last.state, SessionState::Stopped);
    assert_eq!(sim.live_tracks(), 0);

    // A late answer from the host must not resurrect a stream.
    sim.release_opens();
    sleep(Duration::from_millis(20)).await;
    assert_eq!(sim.live_tracks(), 0);
    assert!(
        !sim.events()
            .iter()
            .any(|e| matches!(e, MediaEvent::Opened { device, .. } if device == "d2"))
    );
}

#[tokio::test]
async fn stop_while_a_frame_is_pending_releases_the_camera() {
    let sim = back_and_front();
    sim.hold_frames();
    let (handle, _scans) = start(&sim);
    active_on(&handle, "d1").await;
    eventually(|| sim.frame_requests() >= 1).await;

    let last = timeout(WAIT, handle.stop())
        .await
        .expect("stop blocked behind a stalled frame")
        .unwrap();
    assert_eq!(last.state, SessionState::Stopped);
    assert_eq!(sim.live_tracks(), 0);
    assert!(
        !sim.events()
            .iter()
            .any(|e| matches!(e, MediaEvent::Dropped { .. }))
    );
}

#[tokio::test]
async fn switch_while_a_frame_is_pending_moves_cameras() {
    let sim = back_and_front();
    sim.hold_frames();
    let (handle, mut scans) = start(&sim);
    active_on(&handle, "d1").await;
    eventually(|| sim.frame_requests() >= 1).await;

    handle.request_switch().unwrap();
    active_on(&handle, "d2").await;
    assert_eq!(sim.live_tracks(), 1);
    assert_eq!(sim.peak_live_streams(), 1);

    sim.push_text("d2", "TICKET-9");
    sim.release_frames();
    assert_eq!(next_scan(&mut scans).await.text, "TICKET-9");

    handle.stop().await.unwrap();
    assert_eq!(sim.live_tracks(), 0);
}

#[tokio::test]
async fn zero_sample_interval_still_runs_and_tears_down() {
    let sim = back_and_front();
    let (tx, mut scans) = mpsc::unbounded_channel();
    let options = SessionOptions {
        sample_interval: Duration::ZERO,
        ..Default::default()
    };
    let handle = ScanSession::new(sim.clone(), options, move |scan| {
        let _ = tx.send(scan);
    })
    .spawn();

    active_on(&handle, "d1").await;
    sim.push_text("d1", "TICKET-0");
    assert_eq!(next_scan(&mut scans).await.text, "TICKET-0");

    let last = handle.stop().await.unwrap();
    assert_eq!(last.state, SessionState::Stopped);
    assert_eq!(sim.live_tracks(), 0);
    assert!(
        !sim.events()
            .iter()
            .any(|e| matches!(e, MediaEvent::Dropped { .. }))
    );
}

#[tokio::test]
async fn dropping_the_handle_releases_the_camera() {
    let sim = back_and_front();
    let (handle, _scans) = start(&sim);
    active_on(&handle, "d1").await;
    assert_eq!(sim.live_tracks(), 1);

    drop(handle);
    eventually(|| sim.live_tracks() == 0).await;
}

#[tokio::test]
async fn permission_denied_never_opens_a_stream() {
    let sim = back_and_front();
    sim.deny_permission();
    let (handle, _scans) = start(&sim);

    let status = wait_until(&handle, |s| s.state == SessionState::PermissionDenied).await;
    assert!(status.is_terminal());
    assert!(status.message.unwrap().contains("permission"));

    handle.request_switch().unwrap();
    handle.request_switch_to(1).unwrap();
    sleep(Duration::from_millis(30)).await;
    assert_eq!(handle.status().state, SessionState::PermissionDenied);

    handle.stop().await.unwrap();
    assert_eq!(sim.open_requests(), 0);
    assert_eq!(sim.events(), vec![MediaEvent::Enumerated]);
}

#[tokio::test]
async fn failed_switch_returns_to_previous_camera() {
    let sim = back_and_front();
    sim.fail_opens_for("d2");
    let (handle, _scans) = start(&sim);
    active_on(&handle, "d1").await;

    handle.request_switch().unwrap();
    let status = wait_until(&handle, |s| {
        s.state == SessionState::Active && s.message.is_some()
    })
    .await;
    assert_eq!(status.active_device.unwrap().id, "d1");
    assert!(status.message.unwrap().contains("Could not switch camera"));
    assert_eq!(sim.live_tracks(), 1);
    assert_eq!(sim.peak_live_streams(), 1);

    let events = sim.events();
    let failed = position(&events, |e| {
        matches!(e, MediaEvent::OpenFailed { device } if device == "d2")
    });
    let reopened = events
        .iter()
        .rposition(|e| matches!(e, MediaEvent::Opened { device, .. } if device == "d1"))
        .unwrap();
    assert!(failed < reopened);

    handle.stop().await.unwrap();
    assert_eq!(sim.live_tracks(), 0);
}

#[tokio::test]
async fn failed_initial_open_waits_for_explicit_choice() {
    let sim = back_and_front();
    sim.fail_opens_for("d1");
    let (handle, _scans) = start(&sim);

    let status = wait_until(&handle, |s| s.state == SessionState::Failed).await;
    assert!(status.active_device.is_none());
    sleep(Duration::from_millis(30)).await;
    assert_eq!(sim.open_requests(), 1, "no automatic retry");

    handle.request_switch_to(1).unwrap();
    active_on(&handle, "d2").await;

    handle.stop().await.unwrap();
    assert_eq!(sim.live_tracks(), 0);
}
