//! Ticket badge rendering

use crate::error::{Error, Result};
use image::{DynamicImage, Luma};
use qrcode::QrCode;
use std::path::Path;

/// QR code encoder
pub struct QrEncoder {
    ecc_level: qrcode::EcLevel,
}

impl QrEncoder {
    /// Create a new QR encoder with default settings (Medium ECC)
    pub fn new() -> Self {
        Self {
            ecc_level: qrcode::EcLevel::M,
        }
    }

    /// Create a new QR encoder with a specific error correction level
    pub fn with_ecc_level(ecc_level: qrcode::EcLevel) -> Self {
        Self { ecc_level }
    }

    /// Render `data` as a QR code image
    pub fn encode_string(&self, data: &str) -> Result<DynamicImage> {
        let code = QrCode::with_error_correction_level(data.as_bytes(), self.ecc_level)
            .map_err(|e| Error::QrEncode(format!("Failed to create QR code: {}", e)))?;

        let image = code
            .render::<Luma<u8>>()
            .min_dimensions(400, 400) // Minimum size for reliable scanning
            .build();

        Ok(DynamicImage::ImageLuma8(image))
    }

    /// Render a ticket code and write it as an image file (format from extension)
    pub fn save_badge(&self, code: &str, path: &Path) -> Result<()> {
        let image = self.encode_string(code)?;
        image.save(path)?;
        tracing::info!(code, path = %path.display(), "Ticket badge written");
        Ok(())
    }
}

impl Default for QrEncoder {
    fn default() -> Self {
        Self::new()
    }
}
