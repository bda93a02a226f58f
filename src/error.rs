//! Error types for ticketscan operations

use thiserror::Error;

/// Result type alias using ticketscan's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for ticketscan operations
#[derive(Error, Debug)]
pub enum Error {
    /// The user (or the host) refused camera access
    #[error("Camera permission denied: {0}")]
    PermissionDenied(String),

    /// Device busy, unavailable or failing while opening/switching
    #[error("Media error: {0}")]
    Media(String),

    /// Camera device not found
    #[error("Camera device not found: {0}")]
    CameraNotFound(String),

    /// Failed to capture frame from camera
    #[error("Frame capture failed: {0}")]
    FrameCapture(String),

    /// QR code decoding failed
    #[error("Failed to decode QR code: {0}")]
    QrDecode(String),

    /// No QR code found in frame
    #[error("No QR code found in frame")]
    NoQrCodeFound,

    /// QR code encoding failed
    #[error("Failed to encode QR code: {0}")]
    QrEncode(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image processing error
    #[error("Image processing error: {0}")]
    Image(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The scan session is gone or refused a command
    #[error("Session error: {0}")]
    Session(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when the error means camera access was refused.
    pub fn is_permission(&self) -> bool {
        matches!(self, Error::PermissionDenied(_))
    }

    /// True for device-level failures that leave the session usable with another device.
    pub fn is_media(&self) -> bool {
        matches!(
            self,
            Error::Media(_) | Error::CameraNotFound(_) | Error::FrameCapture(_)
        )
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::Image(e.to_string())
    }
}

// V4L errors are converted manually in the camera module

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Other(format!("JSON error: {}", e))
    }
}
