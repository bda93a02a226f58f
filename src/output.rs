//! Rendering of scans and session status for the terminal

use crate::pump::{ScanResult, ScanSource};
use crate::session::{SessionState, SessionStatus};
use serde_json::{Value, json};

/// Structured and human-readable forms of one event
#[derive(Debug, Clone)]
pub struct Rendered {
    /// JSON for downstream tooling
    pub json: Value,
    /// Lines for a terminal
    pub human: Vec<String>,
}

/// Render an accepted scan.
pub fn render_scan(scan: &ScanResult) -> Rendered {
    let source = match &scan.source {
        ScanSource::Camera { device_id } => format!("camera {device_id}"),
        ScanSource::Manual => "manual entry".to_string(),
    };

    Rendered {
        json: json!({
            "event": "scan",
            "text": scan.text,
            "timestamp_ms": scan.timestamp_millis() as u64,
            "source": scan.source,
        }),
        human: vec![format!("Ticket code: {} ({source})", scan.text)],
    }
}

/// Render a status change.
pub fn render_status(status: &SessionStatus) -> Rendered {
    let mut human = Vec::new();
    let headline = match status.state {
        SessionState::Uninitialized | SessionState::RequestingPermission => {
            "Waiting for camera access...".to_string()
        }
        SessionState::PermissionDenied => "Camera access denied".to_string(),
        SessionState::Switching => "Switching camera...".to_string(),
        SessionState::Active => match &status.active_device {
            Some(device) => format!("Scanning with [{}] {}", device.index, device.label),
            None => "Scanning".to_string(),
        },
        SessionState::Failed => "No camera stream".to_string(),
        SessionState::Stopped => "Scanner stopped".to_string(),
    };
    human.push(headline);

    if let Some(message) = &status.message {
        human.push(format!("  {message}"));
    }
    if status.state == SessionState::Active {
        if status.can_switch() {
            human.push(format!(
                "  {} cameras available: 's' to switch",
                status.device_count
            ));
        }
        if status.suppressed {
            human.push("  Scan paused: 'r' to resume".to_string());
        }
    }

    Rendered {
        json: json!({ "event": "status", "status": status }),
        human,
    }
}
