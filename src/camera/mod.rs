//! Camera capability seam and the stream lifecycle built on top of it
//!
//! The host supplies a [`MediaDevices`] implementation (V4L2 on Linux, or the
//! in-process simulator in tests). Everything above this seam only ever talks
//! to devices through it.

mod config;
mod controller;
mod inventory;
#[cfg(feature = "camera")]
mod v4l2;

pub use config::{CameraConfig, PixelFormat, StreamConstraints};
pub use controller::StreamController;
pub use inventory::{CaptureDevice, Facing, classify_facing, discover_devices, initial_device_index};
#[cfg(feature = "camera")]
pub use v4l2::{V4l2MediaDevices, V4l2Stream};

use crate::error::Result;
use async_trait::async_trait;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// Kind of media device reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Camera or other video source
    VideoInput,
    /// Microphone
    AudioInput,
    /// Speaker
    AudioOutput,
}

/// Raw device record as enumerated by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Opaque platform identifier
    pub id: String,
    /// Human-readable name; may be empty before permission is granted
    pub label: String,
    /// Device kind
    pub kind: DeviceKind,
}

impl DeviceInfo {
    /// Convenience constructor for a video input
    pub fn video(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind: DeviceKind::VideoInput,
        }
    }
}

/// One unit of input for the decode pump
#[derive(Debug, Clone)]
pub enum Frame {
    /// A captured image still to be searched for a QR code
    Image(DynamicImage),
    /// Text already decoded by an upstream scanning library
    Text(String),
}

/// Host-supplied camera capability
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Enumerate every media device. Fails with `PermissionDenied` when access is refused.
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Open a live stream on exactly `constraints.device_id`.
    async fn open_video_stream(
        &self,
        constraints: &StreamConstraints,
    ) -> Result<Box<dyn MediaStream>>;
}

/// A live capture stream bound to one device
#[async_trait]
pub trait MediaStream: Send {
    /// Identifier of the device feeding this stream
    fn device_id(&self) -> &str;

    /// Number of tracks still holding the hardware
    fn live_tracks(&self) -> usize;

    /// Pull the next frame
    async fn next_frame(&mut self) -> Result<Frame>;

    /// Stop every track and release the device
    async fn stop(&mut self) -> Result<()>;
}
