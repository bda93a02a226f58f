//! ticketscan - camera acquisition and QR decoding for event check-in
//!
//! Staff point a camera at an attendee's badge; this crate owns everything
//! between the camera hardware and the ticket-validation call.
//!
//! # Features
//!
//! - **Device inventory**: discover video inputs once and prefer a rear-facing camera
//! - **Stream control**: at most one live stream, released before another is opened
//! - **Decode pump**: rqrr-based decoding with single-flight suppression
//! - **Async-first**: one tokio task per session, steered through a handle
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ticketscan::{ScanSession, SessionOptions, V4l2MediaDevices};
//!
//! #[tokio::main]
//! async fn main() -> ticketscan::Result<()> {
//!     let media = Arc::new(V4l2MediaDevices::new());
//!     let session = ScanSession::new(media, SessionOptions::default(), |scan| {
//!         println!("Ticket: {}", scan.text);
//!     });
//!
//!     let handle = session.spawn();
//!     handle.wait_for(|s| s.suppressed).await?;
//!     handle.stop().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs, rust_2024_compatibility)]

pub mod camera;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod output;
pub mod pump;
pub mod qr;
pub mod session;
pub mod simulator;

// Re-exports for convenience
pub use error::{Error, Result};

#[cfg(feature = "camera")]
pub use camera::V4l2MediaDevices;

pub use camera::{CameraConfig, CaptureDevice, Facing, Frame, MediaDevices, MediaStream};
pub use config::{CameraOptions, LogRotation, LoggingOptions, ScanOptions, TicketscanConfig};
pub use pump::{DecodePump, ScanResult, ScanSource};
pub use qr::{QrDecoder, QrEncoder, QrPayload};
pub use session::{
    ScanSession, SessionCommand, SessionControl, SessionHandle, SessionOptions, SessionState,
    SessionStatus,
};
pub use simulator::SimulatedMediaDevices;
