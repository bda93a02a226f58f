//! V4L2 implementation of the camera capability (Linux)

use crate::camera::{
    CameraConfig, DeviceInfo, DeviceKind, Frame, MediaDevices, MediaStream, PixelFormat,
    StreamConstraints,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use image::{DynamicImage, ImageBuffer};
use std::io;
use std::mem;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;

const MAX_NODES: usize = 10;

/// Upper bound on one blocking dequeue, and so on how long `stop()` can wait for it.
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(2);

/// Cameras exposed as `/dev/videoN` nodes
#[derive(Debug, Default, Clone, Copy)]
pub struct V4l2MediaDevices;

impl V4l2MediaDevices {
    /// Create the V4L2 capability
    pub fn new() -> Self {
        Self
    }

    fn node_index(device_id: &str) -> Result<usize> {
        device_id
            .strip_prefix("/dev/video")
            .and_then(|n| n.parse::<usize>().ok())
            .ok_or_else(|| Error::CameraNotFound(format!("Not a V4L2 node: {device_id}")))
    }
}

fn map_open_error(path: &str, err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::PermissionDenied => {
            Error::PermissionDenied(format!("No access to {path}: {err}"))
        }
        io::ErrorKind::NotFound => Error::CameraNotFound(format!("{path}: {err}")),
        _ => Error::Media(format!("Failed to open {path}: {err}")),
    }
}

#[async_trait]
impl MediaDevices for V4l2MediaDevices {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>> {
        let mut devices = Vec::new();
        let mut denied = 0usize;

        for index in 0..MAX_NODES {
            let path = format!("/dev/video{index}");
            let dev = match v4l::Device::new(index) {
                Ok(dev) => dev,
                Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                    tracing::debug!(path, "Permission denied while probing");
                    denied += 1;
                    continue;
                }
                Err(_) => continue,
            };

            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            // Metadata nodes share the card name but cannot stream video.
            let kind = if caps
                .capabilities
                .contains(v4l::capability::Flags::VIDEO_CAPTURE)
            {
                DeviceKind::VideoInput
            } else {
                continue;
            };

            devices.push(DeviceInfo {
                id: path,
                label: caps.card,
                kind,
            });
        }

        if devices.is_empty() && denied > 0 {
            return Err(Error::PermissionDenied(format!(
                "{denied} video node(s) present but not accessible; check membership of the 'video' group"
            )));
        }

        Ok(devices)
    }

    async fn open_video_stream(
        &self,
        constraints: &StreamConstraints,
    ) -> Result<Box<dyn MediaStream>> {
        let path = constraints.device_id.clone();
        let index = Self::node_index(&path)?;
        let config = constraints.camera.clone();

        let dev = v4l::Device::new(index).map_err(|e| map_open_error(&path, e))?;

        let mut fmt = dev
            .format()
            .map_err(|e| Error::Media(format!("Failed to get format: {}", e)))?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = config.format.to_fourcc();
        let fmt = dev
            .set_format(&fmt)
            .map_err(|e| Error::Media(format!("Failed to set format: {}", e)))?;

        let mut params = dev
            .params()
            .map_err(|e| Error::Media(format!("Failed to get params: {}", e)))?;
        params.interval = v4l::Fraction::new(1, config.fps.max(1));
        dev.set_params(&params)
            .map_err(|e| Error::Media(format!("Failed to set params: {}", e)))?;

        tracing::info!(
            path,
            width = fmt.width,
            height = fmt.height,
            fps = config.fps,
            fourcc = %String::from_utf8_lossy(&fmt.fourcc.repr),
            "V4L2 stream configured"
        );

        // SAFETY: The boxed device outlives the mmap stream; both live in `Mapped`,
        // whose field order drops the stream first.
        let device = Box::new(dev);
        let static_device: &'static Device =
            unsafe { mem::transmute::<&Device, &'static Device>(device.as_ref()) };

        let mut stream =
            MmapStream::with_buffers(static_device, Type::VideoCapture, config.buffer_count.max(2))
                .map_err(|e| Error::Media(format!("Failed to create stream: {}", e)))?;
        stream.set_timeout(CAPTURE_TIMEOUT);

        let mut config = config;
        config.width = fmt.width;
        config.height = fmt.height;

        Ok(Box::new(V4l2Stream {
            path,
            config,
            mapped: Arc::new(Mutex::new(Some(Mapped {
                stream,
                _device: device,
            }))),
            live: true,
        }))
    }
}

struct Mapped {
    stream: MmapStream<'static>,
    _device: Box<Device>,
}

/// Memory-mapped capture stream on one `/dev/videoN` node
///
/// Dequeue and decode run on the blocking pool, so a stalled camera never
/// holds up the runtime. The mapping sits behind a mutex because an abandoned
/// capture may still be using it when `stop()` arrives.
pub struct V4l2Stream {
    path: String,
    config: CameraConfig,
    mapped: Arc<Mutex<Option<Mapped>>>,
    live: bool,
}

#[async_trait]
impl MediaStream for V4l2Stream {
    fn device_id(&self) -> &str {
        &self.path
    }

    fn live_tracks(&self) -> usize {
        usize::from(self.live)
    }

    async fn next_frame(&mut self) -> Result<Frame> {
        if !self.live {
            return Err(Error::FrameCapture("Stream already stopped".to_string()));
        }

        let mapped = Arc::clone(&self.mapped);
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = mapped.lock().unwrap_or_else(PoisonError::into_inner);
            let mapped = guard
                .as_mut()
                .ok_or_else(|| Error::FrameCapture("Stream already stopped".to_string()))?;
            let (buf, _meta) = mapped
                .stream
                .next()
                .map_err(|e| Error::FrameCapture(format!("Failed to capture: {}", e)))?;
            decode_buffer(&config, buf).map(Frame::Image)
        })
        .await
        .map_err(|e| Error::FrameCapture(format!("Capture task failed: {e}")))?
    }

    async fn stop(&mut self) -> Result<()> {
        if !self.live {
            return Ok(());
        }
        self.live = false;

        // Dropping unmaps the buffers, issues STREAMOFF and closes the fd.
        let mapped = Arc::clone(&self.mapped);
        tokio::task::spawn_blocking(move || {
            let released = mapped.lock().unwrap_or_else(PoisonError::into_inner).take();
            drop(released);
        })
        .await
        .map_err(|e| Error::Media(format!("Failed to release {}: {e}", self.path)))?;

        tracing::debug!(path = %self.path, "V4L2 stream stopped");
        Ok(())
    }
}

fn decode_buffer(config: &CameraConfig, buf: &[u8]) -> Result<DynamicImage> {
    match config.format {
        PixelFormat::Mjpeg => image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
            .map_err(|e| Error::Image(format!("MJPEG decode failed: {}", e))),
        PixelFormat::Yuyv => yuyv_to_rgb(buf, config.width, config.height),
        PixelFormat::Rgb24 => ImageBuffer::from_raw(config.width, config.height, buf.to_vec())
            .map(DynamicImage::ImageRgb8)
            .ok_or_else(|| Error::Image("Failed to create RGB image".to_string())),
    }
}

/// Integer BT.601 conversion of packed YUYV 4:2:2.
fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<DynamicImage> {
    let (w, h) = (width as usize, height as usize);
    let mut rgb = vec![0u8; w * h * 3];

    for (src, dst) in yuyv.chunks_exact(4).zip(rgb.chunks_exact_mut(6)) {
        let u = src[1] as i32 - 128;
        let v = src[3] as i32 - 128;
        for (luma, px) in [src[0], src[2]].into_iter().zip(dst.chunks_exact_mut(3)) {
            let y = luma as i32;
            px[0] = (y + ((v * 1436) >> 10)).clamp(0, 255) as u8;
            px[1] = (y - ((u * 352 + v * 731) >> 10)).clamp(0, 255) as u8;
            px[2] = (y + ((u * 1814) >> 10)).clamp(0, 255) as u8;
        }
    }

    ImageBuffer::from_raw(width, height, rgb)
        .map(DynamicImage::ImageRgb8)
        .ok_or_else(|| Error::Image("Failed to create RGB image from YUYV".to_string()))
}
