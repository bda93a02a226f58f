//! Camera scan session: discovery, stream switching and the decode loop
//!
//! A session runs as a single tokio task. Everything that touches the camera
//! happens inside that task, one step at a time, so two opens can never race.
//! Callers steer it through [`SessionHandle`] and observe it through
//! [`SessionStatus`].

use crate::camera::{
    CameraConfig, CaptureDevice, MediaDevices, StreamController, discover_devices,
    initial_device_index,
};
use crate::error::{Error, Result};
use crate::metrics;
use crate::pump::{DecodePump, PumpOutcome, ScanResult, ScanSource};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::Instrument;
use uuid::Uuid;

/// Downstream consumer of accepted scans
pub type ScanCallback = Box<dyn FnMut(ScanResult) + Send + 'static>;

/// Lifecycle of a scan session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    /// Created, not started
    Uninitialized,
    /// Waiting for the host to grant camera access
    RequestingPermission,
    /// Access refused; terminal until a new session is started
    PermissionDenied,
    /// Exactly one stream is live and frames are sampled
    Active,
    /// Old stream released, new one being opened
    Switching,
    /// No usable stream; an explicit device choice is needed
    Failed,
    /// Torn down; terminal
    Stopped,
}

/// Device currently providing video
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveDevice {
    /// Index into the session's device list
    pub index: usize,
    /// Platform identifier
    pub id: String,
    /// Human-readable name
    pub label: String,
}

/// Read-only view rendered by the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    /// Current state
    pub state: SessionState,
    /// Device behind the live stream, if any
    pub active_device: Option<ActiveDevice>,
    /// Number of video inputs discovered
    pub device_count: usize,
    /// Last user-facing error or notice
    pub message: Option<String>,
    /// Whether delivery is paused until reset
    pub suppressed: bool,
}

impl SessionStatus {
    fn initial() -> Self {
        Self {
            state: SessionState::Uninitialized,
            active_device: None,
            device_count: 0,
            message: None,
            suppressed: false,
        }
    }

    /// The "switch camera" affordance is offered only with two or more devices.
    pub fn can_switch(&self) -> bool {
        self.device_count >= 2 && self.state == SessionState::Active
    }

    /// Permission or stream negotiation in progress.
    pub fn is_loading(&self) -> bool {
        matches!(
            self.state,
            SessionState::Uninitialized
                | SessionState::RequestingPermission
                | SessionState::Switching
        )
    }

    /// Whether the session reached a state it cannot leave on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            SessionState::PermissionDenied | SessionState::Stopped
        )
    }
}

/// Requests accepted by a running session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Move to the next camera (circular)
    Switch,
    /// Move to an explicit camera index
    SwitchTo(usize),
    /// Lift scan suppression
    Reset,
    /// Feed a manually entered code through the pump
    Submit(String),
    /// Tear down and release everything
    Stop,
}

/// Tunables for a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Capture geometry for every stream
    pub camera: CameraConfig,
    /// Label substring of the camera to prefer at start
    pub preferred_device: Option<String>,
    /// Frame sampling period
    pub sample_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            camera: CameraConfig::default(),
            preferred_device: None,
            sample_interval: Duration::from_millis(300),
        }
    }
}

/// Shortest sampling period a session accepts.
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(1);

enum Flow {
    Continue,
    Stop,
}

/// The camera scan session state machine
pub struct ScanSession {
    id: Uuid,
    media: Arc<dyn MediaDevices>,
    options: SessionOptions,
    devices: Vec<CaptureDevice>,
    controller: StreamController,
    pump: DecodePump,
    state: SessionState,
    on_scan: ScanCallback,
    status: watch::Sender<SessionStatus>,
    last_sample: Option<Instant>,
}

impl ScanSession {
    /// Build a session that delivers accepted scans to `on_scan`.
    pub fn new(
        media: Arc<dyn MediaDevices>,
        mut options: SessionOptions,
        on_scan: impl FnMut(ScanResult) + Send + 'static,
    ) -> Self {
        if options.sample_interval < MIN_SAMPLE_INTERVAL {
            tracing::warn!(
                requested = ?options.sample_interval,
                "Sample interval too short, using {MIN_SAMPLE_INTERVAL:?}"
            );
            options.sample_interval = MIN_SAMPLE_INTERVAL;
        }
        let (status, _) = watch::channel(SessionStatus::initial());
        let controller = StreamController::new(Arc::clone(&media), options.camera.clone());
        Self {
            id: Uuid::new_v4(),
            media,
            options,
            devices: Vec::new(),
            controller,
            pump: DecodePump::new(),
            state: SessionState::Uninitialized,
            on_scan: Box::new(on_scan),
            status,
            last_sample: None,
        }
    }

    /// Session identifier used in logs.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Start the session on the current tokio runtime.
    pub fn spawn(self) -> SessionHandle {
        let (commands, rx) = mpsc::unbounded_channel();
        let status = self.status.subscribe();
        let span = tracing::info_span!("scan_session", session_id = %self.id);
        let task = tokio::spawn(self.run(rx).instrument(span));

        SessionHandle {
            control: SessionControl { commands, status },
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        let mut deferred = Vec::new();

        if let Flow::Continue = self.start(&mut commands, &mut deferred).await {
            self.drain(&mut deferred);

            let mut ticker = time::interval(self.options.sample_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let flow = tokio::select! {
                    biased;
                    cmd = commands.recv() => self.dispatch(cmd, &mut commands, &mut deferred).await,
                    _ = ticker.tick(), if self.state == SessionState::Active => {
                        self.sample(&mut commands, &mut deferred).await
                    }
                };

                if let Flow::Stop = flow {
                    break;
                }
                self.drain(&mut deferred);
            }
        }

        self.teardown().await;
    }

    /// Discovery and the initial open.
    async fn start(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
        deferred: &mut Vec<SessionCommand>,
    ) -> Flow {
        self.set_state(SessionState::RequestingPermission);

        let media = Arc::clone(&self.media);
        let discovery = discover_devices(media.as_ref());
        tokio::pin!(discovery);

        let discovered = loop {
            tokio::select! {
                result = &mut discovery => break result,
                cmd = commands.recv() => match cmd {
                    Some(SessionCommand::Stop) | None => {
                        tracing::info!("Session stopped during discovery");
                        return Flow::Stop;
                    }
                    Some(cmd) => queue_or_reject(cmd, deferred),
                },
            }
        };

        match discovered {
            Ok(devices) => {
                self.devices = devices;
                self.status
                    .send_modify(|s| s.device_count = self.devices.len());
            }
            Err(err) if err.is_permission() => {
                tracing::warn!(error = %err, "Camera permission denied");
                self.fail(SessionState::PermissionDenied, &err);
                return Flow::Continue;
            }
            Err(err) => {
                tracing::error!(error = %err, "Device discovery failed");
                self.fail(SessionState::Failed, &err);
                return Flow::Continue;
            }
        }

        let Some(index) =
            initial_device_index(&self.devices, self.options.preferred_device.as_deref())
        else {
            let err = Error::CameraNotFound("No cameras available".to_string());
            tracing::warn!("No video inputs discovered");
            self.fail(SessionState::Failed, &err);
            return Flow::Continue;
        };

        match self.open_abortable(index, commands, deferred).await {
            None => Flow::Stop,
            Some(Ok(())) => {
                self.set_state(SessionState::Active);
                Flow::Continue
            }
            Some(Err(err)) => {
                metrics::record_media_error();
                tracing::error!(index, error = %err, "Failed to open initial camera");
                let state = if err.is_permission() {
                    SessionState::PermissionDenied
                } else {
                    SessionState::Failed
                };
                self.fail(state, &err);
                Flow::Continue
            }
        }
    }

    async fn dispatch(
        &mut self,
        cmd: Option<SessionCommand>,
        commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
        deferred: &mut Vec<SessionCommand>,
    ) -> Flow {
        match cmd {
            Some(SessionCommand::Stop) | None => Flow::Stop,
            Some(SessionCommand::Switch) => self.request_next(commands, deferred).await,
            Some(SessionCommand::SwitchTo(index)) => self.switch_to(index, commands, deferred).await,
            Some(other) => {
                self.apply(other);
                Flow::Continue
            }
        }
    }

    async fn request_next(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
        deferred: &mut Vec<SessionCommand>,
    ) -> Flow {
        let current = self.controller.active_index().unwrap_or(0);
        match StreamController::next_index(current, self.devices.len()) {
            Some(next) => self.switch_to(next, commands, deferred).await,
            None => {
                tracing::debug!(devices = self.devices.len(), "Switch ignored: nothing to switch to");
                Flow::Continue
            }
        }
    }

    /// Release the current stream, then open `target`.
    ///
    /// On failure the previously active device is re-acquired once.
    async fn switch_to(
        &mut self,
        target: usize,
        commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
        deferred: &mut Vec<SessionCommand>,
    ) -> Flow {
        if !matches!(self.state, SessionState::Active | SessionState::Failed) {
            tracing::debug!(state = ?self.state, "Switch ignored in current state");
            return Flow::Continue;
        }
        if target >= self.devices.len() {
            tracing::warn!(target, devices = self.devices.len(), "Switch to unknown camera index");
            return Flow::Continue;
        }
        let previous = self.controller.active_index();
        if previous == Some(target) {
            return Flow::Continue;
        }

        tracing::info!(from = ?previous, to = target, "Switching camera");
        self.set_state(SessionState::Switching);
        self.controller.close_stream().await;
        self.status.send_modify(|s| s.active_device = None);

        let err = match self.open_abortable(target, commands, deferred).await {
            None => return Flow::Stop,
            Some(Ok(())) => {
                metrics::record_switch(true);
                self.status.send_modify(|s| s.message = None);
                self.set_state(SessionState::Active);
                return Flow::Continue;
            }
            Some(Err(err)) => err,
        };

        metrics::record_switch(false);
        metrics::record_media_error();
        tracing::warn!(target, error = %err, "Camera switch failed");

        let Some(previous) = previous else {
            self.fail(SessionState::Failed, &err);
            return Flow::Continue;
        };

        match self.open_abortable(previous, commands, deferred).await {
            None => Flow::Stop,
            Some(Ok(())) => {
                let message = format!("Could not switch camera: {err}");
                self.status.send_modify(|s| s.message = Some(message));
                self.set_state(SessionState::Active);
                Flow::Continue
            }
            Some(Err(restore)) => {
                metrics::record_media_error();
                tracing::error!(index = previous, error = %restore, "Failed to restore previous camera");
                self.fail(SessionState::Failed, &restore);
                Flow::Continue
            }
        }
    }

    /// Open `index` while still listening for `Stop`.
    ///
    /// Returns `None` when the request was abandoned; the pending open is dropped
    /// and whatever it would have produced is never recorded.
    async fn open_abortable(
        &mut self,
        index: usize,
        commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
        deferred: &mut Vec<SessionCommand>,
    ) -> Option<Result<()>> {
        let Some(device) = self.devices.get(index).cloned() else {
            return Some(Err(Error::CameraNotFound(format!("camera index {index}"))));
        };

        let result = {
            let open = self.controller.open_stream(&device);
            tokio::pin!(open);

            loop {
                tokio::select! {
                    result = &mut open => break result,
                    cmd = commands.recv() => match cmd {
                        Some(SessionCommand::Stop) | None => {
                            tracing::info!(index, "Open abandoned by teardown");
                            return None;
                        }
                        Some(cmd) => queue_or_reject(cmd, deferred),
                    },
                }
            }
        };

        if result.is_ok() {
            self.status.send_modify(|s| {
                s.active_device = Some(ActiveDevice {
                    index: device.index,
                    id: device.id.clone(),
                    label: device.label.clone(),
                })
            });
        }
        Some(result)
    }

    /// Pull one frame and feed it to the pump.
    ///
    /// A command arriving while the frame is pending wins: the capture is
    /// abandoned and the command handled, so a stalled camera cannot block
    /// teardown or a switch.
    async fn sample(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
        deferred: &mut Vec<SessionCommand>,
    ) -> Flow {
        let Some(stream) = self.controller.active_stream_mut() else {
            return Flow::Continue;
        };
        let device_id = stream.device_id().to_string();

        let started = Instant::now();
        if let Some(previous) = self.last_sample.replace(started) {
            metrics::record_frame_interval(started.saturating_duration_since(previous));
        }

        let captured = {
            let next = stream.next_frame();
            tokio::pin!(next);
            tokio::select! {
                biased;
                cmd = commands.recv() => Err(cmd),
                result = &mut next => Ok(result),
            }
        };

        let frame = match captured {
            Ok(Ok(frame)) => frame,
            Ok(Err(err)) => {
                metrics::record_capture_error();
                tracing::warn!(device = %device_id, error = %err, "Frame capture failed");
                return Flow::Continue;
            }
            Err(cmd) => {
                tracing::debug!(device = %device_id, "Frame capture abandoned for a command");
                return self.dispatch(cmd, commands, deferred).await;
            }
        };

        let outcome = self.pump.process(&frame, &device_id);
        metrics::record_frame(started.elapsed(), &outcome, &device_id);
        self.deliver(outcome);
        Flow::Continue
    }

    fn apply(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Reset => {
                self.pump.reset();
                self.status.send_modify(|s| s.suppressed = false);
            }
            SessionCommand::Submit(code) => {
                if self.is_terminal() {
                    tracing::debug!("Manual code ignored in terminal state");
                    return;
                }
                let outcome = self.pump.submit_text(&code, ScanSource::Manual);
                self.deliver(outcome);
            }
            other => tracing::debug!(command = ?other, "Command not applicable here"),
        }
    }

    fn deliver(&mut self, outcome: PumpOutcome) {
        if let PumpOutcome::Accepted(result) = outcome {
            tracing::info!(text = %result.text, source = ?result.source, "Scan accepted");
            self.status.send_modify(|s| s.suppressed = true);
            (self.on_scan)(result);
        }
    }

    fn drain(&mut self, deferred: &mut Vec<SessionCommand>) {
        for cmd in deferred.drain(..) {
            self.apply(cmd);
        }
    }

    async fn teardown(&mut self) {
        self.controller.close_stream().await;
        self.status.send_modify(|s| s.active_device = None);
        self.set_state(SessionState::Stopped);
        tracing::info!("Scan session stopped");
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            SessionState::PermissionDenied | SessionState::Stopped
        )
    }

    fn fail(&mut self, state: SessionState, err: &Error) {
        let message = err.to_string();
        self.status.send_modify(|s| s.message = Some(message));
        self.set_state(state);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::debug!(from = ?self.state, to = ?state, "Session state change");
        }
        self.state = state;
        self.status.send_modify(|s| s.state = state);
    }
}

fn queue_or_reject(cmd: SessionCommand, deferred: &mut Vec<SessionCommand>) {
    match cmd {
        SessionCommand::Switch | SessionCommand::SwitchTo(_) => {
            tracing::debug!("Camera negotiation in flight, switch request rejected");
        }
        other => deferred.push(other),
    }
}

/// Cloneable sender side of a running session
#[derive(Clone)]
pub struct SessionControl {
    commands: mpsc::UnboundedSender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionControl {
    fn send(&self, cmd: SessionCommand) -> Result<()> {
        self.commands
            .send(cmd)
            .map_err(|_| Error::Session("Scan session is no longer running".to_string()))
    }

    /// Ask for the next camera. A no-op with fewer than two devices.
    pub fn request_switch(&self) -> Result<()> {
        self.send(SessionCommand::Switch)
    }

    /// Ask for a specific camera.
    pub fn request_switch_to(&self, index: usize) -> Result<()> {
        self.send(SessionCommand::SwitchTo(index))
    }

    /// Resume delivering scans.
    pub fn reset(&self) -> Result<()> {
        self.send(SessionCommand::Reset)
    }

    /// Feed a manually entered ticket code.
    pub fn submit(&self, code: impl Into<String>) -> Result<()> {
        self.send(SessionCommand::Submit(code.into()))
    }

    /// Ask the session to tear down without waiting for it.
    pub fn request_stop(&self) -> Result<()> {
        self.send(SessionCommand::Stop)
    }

    /// Latest published status.
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Wait until the status satisfies `predicate`.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&SessionStatus) -> bool,
    ) -> Result<SessionStatus> {
        let mut status = self.status.clone();
        let seen = status
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| Error::Session("Scan session ended".to_string()))?;
        Ok(seen.clone())
    }

    /// Subscribe to status changes.
    pub fn watch(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }
}

/// Owner of a running session
pub struct SessionHandle {
    control: SessionControl,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// A cloneable control for other tasks.
    pub fn control(&self) -> SessionControl {
        self.control.clone()
    }

    /// Ask for the next camera.
    pub fn request_switch(&self) -> Result<()> {
        self.control.request_switch()
    }

    /// Ask for a specific camera.
    pub fn request_switch_to(&self, index: usize) -> Result<()> {
        self.control.request_switch_to(index)
    }

    /// Resume delivering scans.
    pub fn reset(&self) -> Result<()> {
        self.control.reset()
    }

    /// Feed a manually entered ticket code.
    pub fn submit(&self, code: impl Into<String>) -> Result<()> {
        self.control.submit(code)
    }

    /// Latest published status.
    pub fn status(&self) -> SessionStatus {
        self.control.status()
    }

    /// Wait until the status satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SessionStatus) -> bool,
    ) -> Result<SessionStatus> {
        self.control.wait_for(predicate).await
    }

    /// Tear down and wait until every track is released.
    pub async fn stop(self) -> Result<SessionStatus> {
        let mut status = self.control.status.clone();
        // The session may already be gone; teardown has run in that case.
        let _ = self.control.request_stop();
        self.task
            .await
            .map_err(|e| Error::Session(format!("Scan session task failed: {e}")))?;
        let last = status.borrow_and_update().clone();
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_affordance() {
        let mut status = SessionStatus::initial();
        status.state = SessionState::Active;
        status.device_count = 1;
        assert!(!status.can_switch());
        status.device_count = 2;
        assert!(status.can_switch());
        status.state = SessionState::Switching;
        assert!(!status.can_switch());
        assert!(status.is_loading());
    }

    #[test]
    fn test_rejects_switch_while_negotiating() {
        let mut deferred = Vec::new();
        queue_or_reject(SessionCommand::Switch, &mut deferred);
        queue_or_reject(SessionCommand::SwitchTo(1), &mut deferred);
        queue_or_reject(SessionCommand::Reset, &mut deferred);
        queue_or_reject(SessionCommand::Submit("T-1".into()), &mut deferred);
        assert_eq!(
            deferred,
            vec![SessionCommand::Reset, SessionCommand::Submit("T-1".into())]
        );
    }

    #[test]
    fn test_zero_interval_is_raised_to_floor() {
        let media = Arc::new(crate::simulator::SimulatedMediaDevices::new(Vec::new()));
        let options = SessionOptions {
            sample_interval: Duration::ZERO,
            ..Default::default()
        };
        let session = ScanSession::new(media, options, |_| {});
        assert_eq!(session.options.sample_interval, MIN_SAMPLE_INTERVAL);
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&SessionState::RequestingPermission).unwrap();
        assert_eq!(json, "\"requesting-permission\"");
    }
}
