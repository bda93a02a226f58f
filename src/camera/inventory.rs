//! Device discovery and front/back classification

use crate::camera::{DeviceKind, MediaDevices};
use crate::error::Result;
use serde::{Deserialize, Serialize};

const BACK_MARKERS: &[&str] = &["back", "rear", "environment", "traseira", "trasera", "arrière"];
const FRONT_MARKERS: &[&str] = &["front", "user", "selfie", "facetime", "dianteira"];

/// Orientation inferred from a device label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    /// Faces the operator
    Front,
    /// Faces away from the operator
    Back,
    /// Label gave no hint
    Unknown,
}

/// A video input discovered for this session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureDevice {
    /// Position in enumeration order
    pub index: usize,
    /// Opaque platform identifier
    pub id: String,
    /// Human-readable name
    pub label: String,
    /// Heuristic orientation
    pub facing: Facing,
}

/// Best-effort orientation from label text. Back markers win when both match.
pub fn classify_facing(label: &str) -> Facing {
    let label = label.to_lowercase();
    if BACK_MARKERS.iter().any(|marker| label.contains(marker)) {
        Facing::Back
    } else if FRONT_MARKERS.iter().any(|marker| label.contains(marker)) {
        Facing::Front
    } else {
        Facing::Unknown
    }
}

/// Enumerate the host's devices and keep the video inputs.
///
/// Runs once per session; hot-plugged devices are not picked up afterwards.
pub async fn discover_devices(media: &dyn MediaDevices) -> Result<Vec<CaptureDevice>> {
    let all = media.enumerate_devices().await?;
    let total = all.len();

    let devices: Vec<CaptureDevice> = all
        .into_iter()
        .filter(|info| info.kind == DeviceKind::VideoInput)
        .enumerate()
        .map(|(index, info)| CaptureDevice {
            index,
            facing: classify_facing(&info.label),
            id: info.id,
            label: info.label,
        })
        .collect();

    tracing::debug!(total, video_inputs = devices.len(), "Device inventory built");
    for device in &devices {
        tracing::debug!(
            index = device.index,
            id = %device.id,
            label = %device.label,
            facing = ?device.facing,
            "Discovered camera"
        );
    }

    Ok(devices)
}

/// Pick the device to open first.
///
/// A configured label substring wins when it matches; then the first back-facing
/// device; then whatever was enumerated first.
pub fn initial_device_index(devices: &[CaptureDevice], preferred: Option<&str>) -> Option<usize> {
    if devices.is_empty() {
        return None;
    }

    if let Some(name) = preferred {
        let name = name.to_lowercase();
        if let Some(device) = devices
            .iter()
            .find(|d| d.label.to_lowercase().contains(&name))
        {
            return Some(device.index);
        }
        tracing::warn!(preferred = %name, "Preferred camera not found, using default selection");
    }

    devices
        .iter()
        .find(|d| d.facing == Facing::Back)
        .map(|d| d.index)
        .or(Some(0))
}
