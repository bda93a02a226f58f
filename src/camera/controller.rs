//! Ownership of the single live capture stream

use crate::camera::{CameraConfig, CaptureDevice, MediaDevices, MediaStream, StreamConstraints};
use crate::error::{Error, Result};
use std::sync::Arc;

struct ActiveStream {
    index: usize,
    stream: Box<dyn MediaStream>,
}

/// Owns at most one open stream and is the only place tracks get stopped.
pub struct StreamController {
    media: Arc<dyn MediaDevices>,
    camera: CameraConfig,
    active: Option<ActiveStream>,
}

impl StreamController {
    /// Create a controller that opens streams through `media` with `camera` geometry.
    pub fn new(media: Arc<dyn MediaDevices>, camera: CameraConfig) -> Self {
        Self {
            media,
            camera,
            active: None,
        }
    }

    /// Circular successor of `current`; `None` when there is nothing to switch to.
    pub fn next_index(current: usize, count: usize) -> Option<usize> {
        if count < 2 {
            None
        } else {
            Some((current + 1) % count)
        }
    }

    /// Index of the device currently providing video.
    pub fn active_index(&self) -> Option<usize> {
        self.active.as_ref().map(|a| a.index)
    }

    /// Live tracks held by the active stream (0 when none is open).
    pub fn live_tracks(&self) -> usize {
        self.active
            .as_ref()
            .map(|a| a.stream.live_tracks())
            .unwrap_or(0)
    }

    /// Mutable access to the active stream for frame sampling.
    pub fn active_stream_mut(&mut self) -> Option<&mut (dyn MediaStream + 'static)> {
        self.active.as_mut().map(|a| a.stream.as_mut())
    }

    /// Open `device`, releasing any stream still held first.
    ///
    /// The stream is only recorded once the host has handed it over, so dropping
    /// this future mid-request leaves the controller empty.
    pub async fn open_stream(&mut self, device: &CaptureDevice) -> Result<()> {
        if self.active.is_some() {
            self.close_stream().await;
        }

        let constraints = StreamConstraints::exact(device.id.clone(), &self.camera);
        tracing::info!(index = device.index, id = %device.id, label = %device.label, "Opening camera stream");

        let stream = self.media.open_video_stream(&constraints).await?;
        if stream.device_id() != device.id {
            let mut stray = stream;
            let got = stray.device_id().to_string();
            if let Err(err) = stray.stop().await {
                tracing::warn!(device = %got, error = %err, "Failed to stop mismatched stream");
            }
            return Err(Error::Media(format!(
                "Host opened '{got}' instead of requested '{}'",
                device.id
            )));
        }

        self.active = Some(ActiveStream {
            index: device.index,
            stream,
        });
        Ok(())
    }

    /// Stop every track of the active stream. Errors are logged; the handle is dropped regardless.
    pub async fn close_stream(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };

        let device = active.stream.device_id().to_string();
        match active.stream.stop().await {
            Ok(()) => tracing::info!(index = active.index, id = %device, "Camera stream released"),
            Err(err) => {
                tracing::warn!(index = active.index, id = %device, error = %err, "Error while stopping stream")
            }
        }
    }

    /// Release the current stream, then open `devices[index]`.
    pub async fn switch_to(&mut self, index: usize, devices: &[CaptureDevice]) -> Result<()> {
        let device = devices
            .get(index)
            .ok_or_else(|| Error::CameraNotFound(format!("No camera at index {index}")))?;

        self.close_stream().await;
        self.open_stream(device).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{DeviceInfo, discover_devices};
    use crate::simulator::{MediaEvent, SimulatedMediaDevices};

    async fn setup() -> (Arc<SimulatedMediaDevices>, StreamController, Vec<CaptureDevice>) {
        let sim = Arc::new(SimulatedMediaDevices::new(vec![
            DeviceInfo::video("d1", "Back Camera"),
            DeviceInfo::video("d2", "Front Camera"),
            DeviceInfo::video("d3", "USB Webcam"),
        ]));
        let devices = discover_devices(sim.as_ref()).await.unwrap();
        let controller = StreamController::new(sim.clone(), CameraConfig::default());
        (sim, controller, devices)
    }

    #[test]
    fn test_next_index_is_circular() {
        assert_eq!(StreamController::next_index(0, 3), Some(1));
        assert_eq!(StreamController::next_index(2, 3), Some(0));
        assert_eq!(StreamController::next_index(0, 1), None);
        assert_eq!(StreamController::next_index(0, 0), None);

        let mut index = 1;
        for _ in 0..4 {
            index = StreamController::next_index(index, 4).unwrap();
        }
        assert_eq!(index, 1);
    }

    #[tokio::test]
    async fn test_switch_releases_before_opening() {
        let (sim, mut controller, devices) = setup().await;

        controller.open_stream(&devices[0]).await.unwrap();
        controller.switch_to(1, &devices).await.unwrap();

        assert_eq!(controller.active_index(), Some(1));
        assert_eq!(sim.live_tracks(), 1);
        assert_eq!(sim.peak_live_streams(), 1);

        let events = sim.events();
        let stopped = events
            .iter()
            .position(|e| matches!(e, MediaEvent::Stopped { device, .. } if device == "d1"))
            .unwrap();
        let requested = events
            .iter()
            .position(|e| matches!(e, MediaEvent::OpenRequested { device } if device == "d2"))
            .unwrap();
        assert!(stopped < requested);
    }

    #[tokio::test]
    async fn test_failed_open_leaves_no_stream() {
        let (sim, mut controller, devices) = setup().await;
        sim.fail_opens_for("d3");

        controller.open_stream(&devices[0]).await.unwrap();
        let err = controller.switch_to(2, &devices).await.unwrap_err();

        assert!(err.is_media());
        assert_eq!(controller.active_index(), None);
        assert_eq!(sim.live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (sim, mut controller, devices) = setup().await;
        controller.open_stream(&devices[2]).await.unwrap();
        controller.close_stream().await;
        controller.close_stream().await;
        assert_eq!(controller.live_tracks(), 0);
        assert_eq!(sim.live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_switch_to_unknown_index() {
        let (_sim, mut controller, devices) = setup().await;
        controller.open_stream(&devices[0]).await.unwrap();
        let err = controller.switch_to(7, &devices).await.unwrap_err();
        assert!(matches!(err, Error::CameraNotFound(_)));
        assert_eq!(controller.active_index(), Some(0));
    }
}
