//! Decode pump: frames in, at most one accepted scan out until reset

use crate::camera::Frame;
use crate::error::Error;
use crate::qr::QrDecoder;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Where an accepted payload came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ScanSource {
    /// Decoded from the named camera's stream
    Camera {
        /// Device that produced the frame
        device_id: String,
    },
    /// Typed in by the operator
    Manual,
}

/// A payload handed to the downstream callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    /// Decoded payload
    pub text: String,
    /// Time of decode
    pub timestamp: SystemTime,
    /// Origin of the payload
    pub source: ScanSource,
}

impl ScanResult {
    /// Milliseconds since the Unix epoch, for display and wire formats.
    pub fn timestamp_millis(&self) -> u128 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0)
    }
}

/// Per-frame result, kept distinct so callers can count suppressed scans
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpOutcome {
    /// First payload since the last reset
    Accepted(ScanResult),
    /// A payload was decoded but delivery is suppressed
    Suppressed,
    /// Nothing usable in the frame
    NoResult,
}

/// Turns frames into scan results with single-flight suppression
pub struct DecodePump {
    decoder: QrDecoder,
    suppressed: bool,
}

impl DecodePump {
    /// Create a pump ready to accept the first scan
    pub fn new() -> Self {
        Self {
            decoder: QrDecoder::new(),
            suppressed: false,
        }
    }

    /// Whether a scan was accepted and no reset has happened since.
    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    /// Lift suppression so the next decoded payload is delivered again.
    pub fn reset(&mut self) {
        if self.suppressed {
            tracing::debug!("Scan suppression lifted");
        }
        self.suppressed = false;
    }

    /// Decode `frame` and return a result only when it is accepted.
    pub fn on_frame(&mut self, frame: &Frame, device_id: &str) -> Option<ScanResult> {
        match self.process(frame, device_id) {
            PumpOutcome::Accepted(result) => Some(result),
            PumpOutcome::Suppressed | PumpOutcome::NoResult => None,
        }
    }

    /// Decode `frame` and report what happened to it.
    pub fn process(&mut self, frame: &Frame, device_id: &str) -> PumpOutcome {
        let source = ScanSource::Camera {
            device_id: device_id.to_string(),
        };
        match frame {
            Frame::Text(text) => self.admit(text, source),
            Frame::Image(image) => match self.decoder.decode(image) {
                Ok(payload) => match payload.as_str() {
                    Some(text) => self.admit(text, source),
                    None => {
                        tracing::debug!(
                            bytes = payload.as_bytes().len(),
                            "Ignoring non-UTF-8 QR payload"
                        );
                        PumpOutcome::NoResult
                    }
                },
                Err(Error::NoQrCodeFound) => PumpOutcome::NoResult,
                Err(err) => {
                    tracing::debug!(error = %err, "Frame decode failed");
                    PumpOutcome::NoResult
                }
            },
        }
    }

    /// Push path: text decoded elsewhere or typed in by the operator.
    pub fn submit_text(&mut self, text: &str, source: ScanSource) -> PumpOutcome {
        self.admit(text, source)
    }

    fn admit(&mut self, text: &str, source: ScanSource) -> PumpOutcome {
        if text.trim().is_empty() {
            tracing::debug!("Ignoring empty payload");
            return PumpOutcome::NoResult;
        }
        if self.suppressed {
            tracing::trace!(text, "Scan suppressed until reset");
            return PumpOutcome::Suppressed;
        }

        self.suppressed = true;
        PumpOutcome::Accepted(ScanResult {
            text: text.to_string(),
            timestamp: SystemTime::now(),
            source,
        })
    }
}

impl Default for DecodePump {
    fn default() -> Self {
        Self::new()
    }
}
