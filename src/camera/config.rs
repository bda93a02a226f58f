//! Capture geometry and stream constraints

use serde::{Deserialize, Serialize};

/// Capture settings applied to whichever device the session opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Frames per second requested from the device
    pub fps: u32,

    /// Pixel format (MJPEG recommended for performance)
    pub format: PixelFormat,

    /// Number of V4L2 buffers to keep mapped (higher = smoother but more memory)
    pub buffer_count: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
        }
    }
}

impl CameraConfig {
    /// Preset for lower-end webcams (lower resolution/fps for compatibility)
    pub fn compatible() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 15,
            format: PixelFormat::Yuyv,
            buffer_count: 4,
        }
    }

    /// Preset tuned for badge scanning at arm's length
    pub fn qr_optimized() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 15, // Lower FPS to reduce CPU usage
            format: PixelFormat::Mjpeg,
            buffer_count: 5,
        }
    }
}

/// Constraints for a single open request.
///
/// Always pins an exact device id; there is deliberately no facing-mode hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConstraints {
    /// Platform identifier of the device to open
    pub device_id: String,
    /// Capture geometry
    pub camera: CameraConfig,
}

impl StreamConstraints {
    /// Pin `device_id` exactly with the given capture settings.
    pub fn exact(device_id: impl Into<String>, camera: &CameraConfig) -> Self {
        Self {
            device_id: device_id.into(),
            camera: camera.clone(),
        }
    }
}

/// Pixel format for camera capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Motion JPEG (compressed, recommended for high resolution)
    Mjpeg,
    /// YUYV 4:2:2 (uncompressed, better compatibility)
    Yuyv,
    /// RGB24 (uncompressed, high bandwidth)
    Rgb24,
}

impl PixelFormat {
    /// Convert to V4L2 FourCC code
    #[cfg(feature = "camera")]
    pub fn to_fourcc(self) -> v4l::FourCC {
        match self {
            PixelFormat::Mjpeg => v4l::FourCC::new(b"MJPG"),
            PixelFormat::Yuyv => v4l::FourCC::new(b"YUYV"),
            PixelFormat::Rgb24 => v4l::FourCC::new(b"RGB3"),
        }
    }

    /// Canonical string representation for configuration files
    pub fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Mjpeg => "mjpeg",
            PixelFormat::Yuyv => "yuyv",
            PixelFormat::Rgb24 => "rgb24",
        }
    }

    /// Parse from a user-provided string (case-insensitive)
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mjpeg" | "mjpg" => Some(PixelFormat::Mjpeg),
            "yuyv" => Some(PixelFormat::Yuyv),
            "rgb" | "rgb24" => Some(PixelFormat::Rgb24),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_constraints_pin_device() {
        let constraints = StreamConstraints::exact("d2", &CameraConfig::compatible());
        assert_eq!(constraints.device_id, "d2");
        assert_eq!(constraints.camera.width, 640);
        assert_eq!(constraints.camera.format, PixelFormat::Yuyv);
    }

    #[test]
    #[cfg(feature = "camera")]
    fn test_pixel_format_fourcc() {
        assert_eq!(PixelFormat::Mjpeg.to_fourcc(), v4l::FourCC::new(b"MJPG"));
        assert_eq!(PixelFormat::Yuyv.to_fourcc(), v4l::FourCC::new(b"YUYV"));
    }

    #[test]
    fn test_pixel_format_parse() {
        assert_eq!(PixelFormat::parse("MJPEG"), Some(PixelFormat::Mjpeg));
        assert_eq!(PixelFormat::parse(" yuyv "), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::parse("rgb24"), Some(PixelFormat::Rgb24));
        assert!(PixelFormat::parse("invalid").is_none());
    }
}
