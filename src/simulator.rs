//! In-process camera capability for tests and dry runs
//!
//! Behaves like a host that owns real hardware: streams hold their tracks until
//! `stop()` is called, and a stream dropped without being stopped stays live.
//! Every request is written to a ledger so ordering can be asserted.

use crate::camera::{DeviceInfo, DeviceKind, Frame, MediaDevices, MediaStream, StreamConstraints};
use crate::error::{Error, Result};
use crate::qr::QrEncoder;
use async_trait::async_trait;
use image::{DynamicImage, GrayImage, Luma};
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// One observable action taken against the simulated host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// Device list was requested
    Enumerated,
    /// An open request reached the host
    OpenRequested {
        /// Requested device
        device: String,
    },
    /// The host handed over a live stream
    Opened {
        /// Device behind the stream
        device: String,
        /// Host-assigned stream number
        stream: u64,
    },
    /// Tracks of a stream were stopped
    Stopped {
        /// Device behind the stream
        device: String,
        /// Host-assigned stream number
        stream: u64,
    },
    /// A stream handle went away without being stopped
    Dropped {
        /// Device behind the stream
        device: String,
        /// Host-assigned stream number
        stream: u64,
    },
    /// The host refused an open request
    OpenFailed {
        /// Requested device
        device: String,
    },
}

#[derive(Default)]
struct SimState {
    deny_permission: bool,
    failing: HashSet<String>,
    hold_opens: bool,
    hold_frames: bool,
    frame_requests: usize,
    frames: HashMap<String, VecDeque<Frame>>,
    events: Vec<MediaEvent>,
    live: usize,
    peak: usize,
    next_stream: u64,
}

/// Scripted stand-in for the platform camera API
pub struct SimulatedMediaDevices {
    devices: Vec<DeviceInfo>,
    state: Arc<Mutex<SimState>>,
    release: Arc<Notify>,
    frame_release: Arc<Notify>,
}

impl SimulatedMediaDevices {
    /// Simulate a host exposing `devices`.
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices,
            state: Arc::new(Mutex::new(SimState::default())),
            release: Arc::new(Notify::new()),
            frame_release: Arc::new(Notify::new()),
        }
    }

    /// Load a TOML script describing devices and queued payloads.
    pub fn from_script(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {e}", path.display())))?;
        let script: SimulatorScript = toml::from_str(&contents).map_err(|e| {
            Error::Config(format!("Failed to parse simulator script {}: {e}", path.display()))
        })?;
        script.build()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().expect("simulator mutex poisoned")
    }

    /// Refuse camera access on the next enumeration.
    pub fn deny_permission(&self) {
        self.lock().deny_permission = true;
    }

    /// Make every open of `device_id` fail as if the device were busy.
    pub fn fail_opens_for(&self, device_id: &str) {
        self.lock().failing.insert(device_id.to_string());
    }

    /// Let opens of `device_id` succeed again.
    pub fn clear_failure(&self, device_id: &str) {
        self.lock().failing.remove(device_id);
    }

    /// Keep open requests pending until [`release_opens`](Self::release_opens).
    pub fn hold_opens(&self) {
        self.lock().hold_opens = true;
    }

    /// Let pending and future opens complete.
    pub fn release_opens(&self) {
        self.lock().hold_opens = false;
        self.release.notify_waiters();
    }

    /// Keep frame requests pending, like a camera that stopped delivering.
    pub fn hold_frames(&self) {
        self.lock().hold_frames = true;
    }

    /// Let pending and future frame requests complete.
    pub fn release_frames(&self) {
        self.lock().hold_frames = false;
        self.frame_release.notify_waiters();
    }

    /// Number of frame requests that reached any stream.
    pub fn frame_requests(&self) -> usize {
        self.lock().frame_requests
    }

    /// Queue a payload that an upstream decoder already turned into text.
    pub fn push_text(&self, device_id: &str, text: impl Into<String>) {
        self.push_frame(device_id, Frame::Text(text.into()));
    }

    /// Queue an arbitrary frame for `device_id`.
    pub fn push_frame(&self, device_id: &str, frame: Frame) {
        self.lock()
            .frames
            .entry(device_id.to_string())
            .or_default()
            .push_back(frame);
    }

    /// Frames still queued for `device_id`.
    pub fn pending_frames(&self, device_id: &str) -> usize {
        self.lock()
            .frames
            .get(device_id)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Snapshot of the ledger.
    pub fn events(&self) -> Vec<MediaEvent> {
        self.lock().events.clone()
    }

    /// Tracks currently holding hardware across all streams.
    pub fn live_tracks(&self) -> usize {
        self.lock().live
    }

    /// Highest number of simultaneously live streams ever observed.
    pub fn peak_live_streams(&self) -> usize {
        self.lock().peak
    }

    /// Number of open requests that reached the host.
    pub fn open_requests(&self) -> usize {
        self.lock()
            .events
            .iter()
            .filter(|e| matches!(e, MediaEvent::OpenRequested { .. }))
            .count()
    }
}

#[async_trait]
impl MediaDevices for SimulatedMediaDevices {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>> {
        let mut state = self.lock();
        state.events.push(MediaEvent::Enumerated);
        if state.deny_permission {
            return Err(Error::PermissionDenied(
                "Camera access was refused".to_string(),
            ));
        }
        Ok(self.devices.clone())
    }

    async fn open_video_stream(
        &self,
        constraints: &StreamConstraints,
    ) -> Result<Box<dyn MediaStream>> {
        let device = constraints.device_id.clone();
        self.lock().events.push(MediaEvent::OpenRequested {
            device: device.clone(),
        });

        loop {
            let released = self.release.notified();
            if !self.lock().hold_opens {
                break;
            }
            released.await;
        }

        let mut state = self.lock();
        let known = self
            .devices
            .iter()
            .any(|d| d.id == device && d.kind == DeviceKind::VideoInput);
        if !known {
            state.events.push(MediaEvent::OpenFailed {
                device: device.clone(),
            });
            return Err(Error::CameraNotFound(format!("Unknown device '{device}'")));
        }
        if state.deny_permission {
            state.events.push(MediaEvent::OpenFailed {
                device: device.clone(),
            });
            return Err(Error::PermissionDenied(
                "Camera access was revoked".to_string(),
            ));
        }
        if state.failing.contains(&device) {
            state.events.push(MediaEvent::OpenFailed {
                device: device.clone(),
            });
            return Err(Error::Media(format!("Device '{device}' is busy")));
        }

        state.next_stream += 1;
        let id = state.next_stream;
        state.live += 1;
        state.peak = state.peak.max(state.live);
        state.events.push(MediaEvent::Opened {
            device: device.clone(),
            stream: id,
        });

        Ok(Box::new(SimulatedStream {
            id,
            device,
            live: true,
            state: Arc::clone(&self.state),
            release: Arc::clone(&self.frame_release),
        }))
    }
}

/// Stream handed out by [`SimulatedMediaDevices`]
pub struct SimulatedStream {
    id: u64,
    device: String,
    live: bool,
    state: Arc<Mutex<SimState>>,
    release: Arc<Notify>,
}

impl SimulatedStream {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().expect("simulator mutex poisoned")
    }
}

#[async_trait]
impl MediaStream for SimulatedStream {
    fn device_id(&self) -> &str {
        &self.device
    }

    fn live_tracks(&self) -> usize {
        usize::from(self.live)
    }

    async fn next_frame(&mut self) -> Result<Frame> {
        if !self.live {
            return Err(Error::FrameCapture("Stream already stopped".to_string()));
        }
        self.lock().frame_requests += 1;

        loop {
            let released = self.release.notified();
            if !self.lock().hold_frames {
                break;
            }
            released.await;
        }

        let queued = self
            .lock()
            .frames
            .get_mut(&self.device)
            .and_then(VecDeque::pop_front);

        Ok(queued.unwrap_or_else(blank_frame))
    }

    async fn stop(&mut self) -> Result<()> {
        if !self.live {
            return Ok(());
        }
        self.live = false;
        let mut state = self.lock();
        state.live = state.live.saturating_sub(1);
        state.events.push(MediaEvent::Stopped {
            device: self.device.clone(),
            stream: self.id,
        });
        Ok(())
    }
}

impl Drop for SimulatedStream {
    fn drop(&mut self) {
        if self.live {
            if let Ok(mut state) = self.state.lock() {
                state.events.push(MediaEvent::Dropped {
                    device: self.device.clone(),
                    stream: self.id,
                });
            }
        }
    }
}

fn blank_frame() -> Frame {
    Frame::Image(DynamicImage::ImageLuma8(GrayImage::from_pixel(
        64,
        64,
        Luma([255u8]),
    )))
}

/// TOML description of a simulated host
#[derive(Debug, Deserialize)]
struct SimulatorScript {
    #[serde(default)]
    deny_permission: bool,
    /// Render queued payloads as QR images instead of pre-decoded text
    #[serde(default)]
    render_qr: bool,
    #[serde(default)]
    devices: Vec<ScriptDevice>,
    #[serde(default)]
    frames: HashMap<String, Vec<String>>,
    #[serde(default)]
    busy: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ScriptDevice {
    id: String,
    #[serde(default)]
    label: String,
    #[serde(default = "default_kind")]
    kind: DeviceKind,
}

fn default_kind() -> DeviceKind {
    DeviceKind::VideoInput
}

impl SimulatorScript {
    fn build(self) -> Result<SimulatedMediaDevices> {
        let devices = self
            .devices
            .into_iter()
            .map(|d| DeviceInfo {
                id: d.id,
                label: d.label,
                kind: d.kind,
            })
            .collect();
        let sim = SimulatedMediaDevices::new(devices);

        if self.deny_permission {
            sim.deny_permission();
        }
        for device in &self.busy {
            sim.fail_opens_for(device);
        }

        let encoder = QrEncoder::new();
        for (device, payloads) in self.frames {
            for payload in payloads {
                if self.render_qr {
                    sim.push_frame(&device, Frame::Image(encoder.encode_string(&payload)?));
                } else {
                    sim.push_text(&device, payload);
                }
            }
        }

        Ok(sim)
    }
}
