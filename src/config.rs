//! Runtime configuration handling
//!
//! Sources are layered: file (`--config`, else discovered), then `TICKETSCAN_*`
//! environment variables, then whatever the daemon's flags override.

use crate::camera::{CameraConfig, PixelFormat};
use crate::error::{Error, Result};
use crate::session::SessionOptions;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const FILE_NAMES: [&str; 3] = ["ticketscan.toml", "ticketscan.yaml", "ticketscan.yml"];
const XDG_FILE_NAMES: [&str; 2] = ["config.toml", "config.yaml"];

/// Everything the daemon reads from disk or environment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketscanConfig {
    /// Which camera to prefer and how to capture from it
    pub camera: CameraOptions,
    /// Decode loop pacing
    pub scan: ScanOptions,
    /// Log output
    pub logging: LoggingOptions,
    /// Runtime counters
    pub metrics: MetricsOptions,
}

impl TicketscanConfig {
    /// Load from `explicit_path`, or from the first file found in the usual places.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut config = match explicit_path {
            Some(path) => Self::from_file(path)?,
            None => match Self::discover_file()? {
                Some(path) => {
                    tracing::info!(path = %path.display(), "Using configuration file");
                    Self::from_file(&path)?
                }
                None => {
                    tracing::debug!("No configuration file found, using defaults");
                    Self::default()
                }
            },
        };

        config.camera.apply_env_overrides();
        config.scan.apply_env_overrides();
        config.logging.apply_env_overrides();
        config.metrics.apply_env_overrides();
        Ok(config)
    }

    /// Look in the working directory, then under `$XDG_CONFIG_HOME/ticketscan`.
    fn discover_file() -> Result<Option<PathBuf>> {
        let cwd =
            env::current_dir().map_err(|e| Error::Config(format!("Failed to read cwd: {e}")))?;
        let local = FILE_NAMES.iter().map(|name| cwd.join(name));

        let xdg = env::var_os("XDG_CONFIG_HOME")
            .map(|dir| PathBuf::from(dir).join("ticketscan"))
            .into_iter()
            .flat_map(|base| XDG_FILE_NAMES.iter().map(move |name| base.join(name)));

        Ok(local.chain(xdg).find(|path| path.exists()))
    }

    /// Parse a TOML or YAML file, chosen by extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {e}", path.display())))?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("Invalid TOML in {}: {e}", path.display()))),
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("Invalid YAML in {}: {e}", path.display()))),
            other => Err(Error::Config(format!(
                "Unsupported config format '{other}', expected toml or yaml"
            ))),
        }
    }

    /// Resolve everything a scan session needs.
    pub fn session_options(&self) -> Result<SessionOptions> {
        Ok(SessionOptions {
            camera: self.camera.to_camera_config()?,
            preferred_device: self.camera.device_name.clone(),
            sample_interval: self.scan.sample_interval(),
        })
    }
}

/// Starting point for capture settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CameraPreset {
    /// 1280x720 MJPEG
    #[default]
    Standard,
    /// 640x480 YUYV for cameras without MJPEG
    Compatible,
    /// Full HD, tuned for reading badges
    QrOptimized,
}

impl CameraPreset {
    fn base(self) -> CameraConfig {
        match self {
            Self::Standard => CameraConfig::default(),
            Self::Compatible => CameraConfig::compatible(),
            Self::QrOptimized => CameraConfig::qr_optimized(),
        }
    }
}

impl FromStr for CameraPreset {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "standard" | "default" => Ok(Self::Standard),
            "compatible" => Ok(Self::Compatible),
            "qr-optimized" | "qr" => Ok(Self::QrOptimized),
            other => Err(format!("Unknown camera preset '{other}'")),
        }
    }
}

/// Camera selection plus per-field overrides on top of a preset
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraOptions {
    /// Label substring of the camera to open first (e.g. "Facecam")
    pub device_name: Option<String>,
    /// Capture settings the overrides below are applied to
    pub preset: CameraPreset,
    /// Frame width in pixels
    pub width: Option<u32>,
    /// Frame height in pixels
    pub height: Option<u32>,
    /// Frames per second
    pub fps: Option<u32>,
    /// Pixel format (mjpeg/yuyv/rgb24)
    pub format: Option<String>,
    /// Number of V4L2 buffers to allocate
    pub buffer_count: Option<u32>,
}

impl CameraOptions {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(name) = env::var("TICKETSCAN_CAMERA_DEVICE") {
            self.device_name = Some(name).filter(|n| !n.trim().is_empty());
        }
        if let Some(preset) = env_value("TICKETSCAN_CAMERA_PRESET") {
            self.preset = preset;
        }
        if let Ok(format) = env::var("TICKETSCAN_CAMERA_FORMAT") {
            self.format = Some(format);
        }
        self.width = env_value("TICKETSCAN_CAMERA_WIDTH").or(self.width);
        self.height = env_value("TICKETSCAN_CAMERA_HEIGHT").or(self.height);
        self.fps = env_value("TICKETSCAN_CAMERA_FPS").or(self.fps);
        self.buffer_count = env_value("TICKETSCAN_CAMERA_BUFFERS").or(self.buffer_count);
    }

    /// Apply the overrides to the chosen preset.
    pub fn to_camera_config(&self) -> Result<CameraConfig> {
        let base = self.preset.base();
        let format = match &self.format {
            Some(name) => PixelFormat::parse(name).ok_or_else(|| {
                Error::Config(format!(
                    "Unknown pixel format '{name}'. Use mjpeg, yuyv, or rgb24"
                ))
            })?,
            None => base.format,
        };

        Ok(CameraConfig {
            width: self.width.unwrap_or(base.width),
            height: self.height.unwrap_or(base.height),
            fps: self.fps.map_or(base.fps, |fps| fps.max(1)),
            format,
            buffer_count: self.buffer_count.map_or(base.buffer_count, |n| n.max(2)),
        })
    }
}

/// Decode loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// Period between frame samples in milliseconds
    pub sample_interval_ms: u64,
    /// Lift suppression this long after each delivered scan; `None` waits for an explicit reset
    pub auto_reset_ms: Option<u64>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            sample_interval_ms: 300,
            auto_reset_ms: Some(2_000),
        }
    }
}

impl ScanOptions {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(ms) = env_value("TICKETSCAN_SAMPLE_INTERVAL_MS") {
            self.sample_interval_ms = ms;
        }
        if let Ok(reset) = env::var("TICKETSCAN_AUTO_RESET_MS") {
            match reset.trim().to_ascii_lowercase().as_str() {
                "" | "off" | "none" | "manual" => self.auto_reset_ms = None,
                value => {
                    if let Ok(ms) = value.parse::<u64>() {
                        self.auto_reset_ms = Some(ms);
                    }
                }
            }
        }
    }

    /// Sampling period, never shorter than 50 ms.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(50))
    }

    /// Delay before suppression is lifted automatically.
    pub fn auto_reset(&self) -> Option<Duration> {
        self.auto_reset_ms.map(Duration::from_millis)
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    /// Filter directives, e.g. `info` or `ticketscan=debug,v4l=warn`
    pub level: String,
    /// Also write logs to this file
    pub file: Option<PathBuf>,
    /// ANSI colors on the console
    pub color: bool,
    /// Rotation applied to `file`
    pub rotation: Option<LogRotation>,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            color: true,
            rotation: None,
        }
    }
}

impl LoggingOptions {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(level) = env::var("TICKETSCAN_LOG_LEVEL") {
            self.level = level;
        }
        if let Ok(file) = env::var("TICKETSCAN_LOG_FILE") {
            self.file = Some(PathBuf::from(file));
        }
        if let Some(color) = env_flag("TICKETSCAN_LOG_COLOR") {
            self.color = color;
        }
        if let Some(rotation) = env_value("TICKETSCAN_LOG_ROTATION") {
            self.rotation = Some(rotation);
        }
    }
}

/// Supported log rotation policies for file sinks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    /// Rotate log files once per hour
    Hourly,
    /// Rotate log files once per day
    Daily,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            other => Err(format!("Unknown log rotation '{other}'")),
        }
    }
}

/// Runtime counters: periodic log summaries and an optional HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsOptions {
    /// Collect counters and log a summary every `interval_secs`
    pub enabled: bool,
    /// Seconds between summaries
    pub interval_secs: u64,
    /// Bind address for the HTTP endpoint (e.g. "127.0.0.1:9900"); implies `enabled`
    pub endpoint: Option<String>,
    /// Body format served by the endpoint
    pub format: MetricsFormat,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 60,
            endpoint: None,
            format: MetricsFormat::Json,
        }
    }
}

impl MetricsOptions {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("TICKETSCAN_METRICS") {
            self.enabled = enabled;
        }
        if let Some(secs) = env_value("TICKETSCAN_METRICS_INTERVAL") {
            self.interval_secs = secs;
        }
        if let Ok(endpoint) = env::var("TICKETSCAN_METRICS_ENDPOINT") {
            self.endpoint = Some(endpoint).filter(|e| !e.trim().is_empty());
        }
        if let Some(format) = env_value("TICKETSCAN_METRICS_FORMAT") {
            self.format = format;
        }
    }

    /// Whether counters should be collected at all.
    pub fn is_enabled(&self) -> bool {
        self.enabled || self.endpoint.is_some()
    }

    /// Parsed endpoint address, if one is configured.
    pub fn endpoint_addr(&self) -> Result<Option<SocketAddr>> {
        self.endpoint
            .as_deref()
            .map(|endpoint| {
                endpoint.parse::<SocketAddr>().map_err(|e| {
                    Error::Config(format!("Invalid metrics endpoint '{endpoint}': {e}"))
                })
            })
            .transpose()
    }
}

/// Supported serialization formats for the metrics endpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetricsFormat {
    /// Emit metrics as structured JSON
    Json,
    /// Emit metrics in Prometheus text exposition format
    Prometheus,
}

impl FromStr for MetricsFormat {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "prometheus" => Ok(Self::Prometheus),
            _ => Err(format!(
                "Unsupported metrics format '{value}', expected 'json' or 'prometheus'"
            )),
        }
    }
}

/// Typed environment lookup; unset or unparsable values are ignored.
fn env_value<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

fn env_flag(key: &str) -> Option<bool> {
    match env::var(key).ok()?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_into_session_options() {
        let config: TicketscanConfig = toml::from_str(
            r#"
            [camera]
            device_name = "Back"
            width = 640
            height = 480
            format = "yuyv"

            [scan]
            sample_interval_ms = 10
            "#,
        )
        .unwrap();

        let options = config.session_options().unwrap();
        assert_eq!(options.preferred_device.as_deref(), Some("Back"));
        assert_eq!(options.camera.width, 640);
        assert_eq!(options.camera.format, PixelFormat::Yuyv);
        assert_eq!(options.sample_interval, Duration::from_millis(50));
        assert_eq!(config.scan.auto_reset(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_yaml_config() {
        let config: TicketscanConfig = serde_yaml::from_str(
            "scan:\n  auto_reset_ms: null\nlogging:\n  level: debug\n  rotation: daily\nmetrics:\n  endpoint: 127.0.0.1:9900\n  format: prometheus\n",
        )
        .unwrap();
        assert_eq!(config.scan.auto_reset(), None);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.rotation, Some(LogRotation::Daily));
        assert!(config.metrics.is_enabled());
        assert_eq!(config.metrics.format, MetricsFormat::Prometheus);
        assert_eq!(
            config.metrics.endpoint_addr().unwrap(),
            Some("127.0.0.1:9900".parse().unwrap())
        );
    }

    #[test]
    fn test_preset_with_overrides() {
        let options = CameraOptions {
            preset: CameraPreset::Compatible,
            fps: Some(0),
            ..Default::default()
        };
        let camera = options.to_camera_config().unwrap();
        let base = CameraConfig::compatible();
        assert_eq!(camera.width, base.width);
        assert_eq!(camera.format, base.format);
        assert_eq!(camera.fps, 1);
    }

    #[test]
    fn test_unknown_pixel_format_rejected() {
        let options = CameraOptions {
            format: Some("h264".to_string()),
            ..Default::default()
        };
        assert!(matches!(options.to_camera_config(), Err(Error::Config(_))));
    }

    #[test]
    fn test_bad_metrics_endpoint() {
        let metrics = MetricsOptions {
            endpoint: Some("localhost".to_string()),
            ..Default::default()
        };
        assert!(matches!(metrics.endpoint_addr(), Err(Error::Config(_))));
        assert_eq!(MetricsOptions::default().endpoint_addr().unwrap(), None);
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!("Prometheus".parse::<MetricsFormat>(), Ok(MetricsFormat::Prometheus));
        assert!("xml".parse::<MetricsFormat>().is_err());
        assert_eq!("qr_optimized".parse::<CameraPreset>(), Ok(CameraPreset::QrOptimized));
        assert_eq!(" Daily ".parse::<LogRotation>(), Ok(LogRotation::Daily));
    }
}
