//! ticketscand - check-in scanner daemon

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use ticketscan::camera::{MediaDevices, discover_devices};
use ticketscan::config::{CameraPreset, MetricsFormat};
use ticketscan::output::{Rendered, render_scan, render_status};
use ticketscan::{
    Error, QrEncoder, Result, ScanResult, ScanSession, SessionControl, SessionState,
    SimulatedMediaDevices, TicketscanConfig, logging, metrics,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "ticketscand",
    version,
    about = "Event check-in ticket scanner daemon"
)]
struct Cli {
    /// Optional configuration file (toml/yaml). Defaults to ticketscan.{toml,yaml} in cwd/XDG config.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Prefer the camera whose label contains NAME
    #[arg(long, value_name = "NAME")]
    device: Option<String>,

    /// Capture preset: standard, compatible or qr-optimized
    #[arg(long, value_name = "PRESET")]
    preset: Option<CameraPreset>,

    /// Frame sampling interval in milliseconds
    #[arg(long, value_name = "MS")]
    interval_ms: Option<u64>,

    /// Output events as JSON lines instead of human-readable text
    #[arg(long)]
    json: bool,

    /// Exit after the first accepted scan
    #[arg(long)]
    once: bool,

    /// List detected cameras and exit
    #[arg(long)]
    list_cameras: bool,

    /// Use a scripted simulator (TOML) instead of real cameras
    #[arg(long, value_name = "PATH")]
    simulator: Option<PathBuf>,

    /// Render a ticket badge for CODE and exit
    #[arg(long, value_name = "CODE", requires = "output")]
    generate: Option<String>,

    /// Image path written by --generate
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Enable metrics output regardless of configuration file settings
    #[arg(long)]
    metrics: bool,

    /// Override metrics endpoint bind address (e.g. 127.0.0.1:9900)
    #[arg(long, value_name = "ADDR")]
    metrics_bind: Option<String>,

    /// Override metrics endpoint format (`json` or `prometheus`)
    #[arg(long, value_name = "FORMAT")]
    metrics_format: Option<String>,
}

struct Printer {
    json: bool,
}

impl Printer {
    fn emit(&self, rendered: &Rendered) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(&rendered.json)?);
        } else {
            for line in &rendered.human {
                println!("{line}");
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = TicketscanConfig::load(cli.config.as_deref())?;

    if let Some(ref name) = cli.device {
        config.camera.device_name = Some(name.clone());
    }
    if let Some(preset) = cli.preset {
        config.camera.preset = preset;
    }
    if let Some(ms) = cli.interval_ms {
        config.scan.sample_interval_ms = ms;
    }
    if cli.metrics {
        config.metrics.enabled = true;
    }
    if let Some(ref bind) = cli.metrics_bind {
        config.metrics.endpoint = Some(bind.clone());
    }
    if let Some(ref format) = cli.metrics_format {
        config.metrics.format = format.parse::<MetricsFormat>().map_err(Error::Config)?;
    }

    logging::init(&config.logging)?;

    if let (Some(code), Some(path)) = (cli.generate.as_deref(), cli.output.as_deref()) {
        return QrEncoder::new().save_badge(code, path);
    }

    if config.metrics.is_enabled() {
        metrics::enable(config.metrics.interval_secs);
        if let Some(addr) = config.metrics.endpoint_addr()? {
            metrics::spawn_http_endpoint(addr, config.metrics.format)?;
        }
    }

    let media = media_devices(&cli)?;

    if cli.list_cameras {
        return list_cameras(media.as_ref()).await;
    }

    let options = config.session_options()?;
    info!(?options, "Starting ticket scanner");

    let (scan_tx, scan_rx) = mpsc::unbounded_channel::<ScanResult>();
    let session = ScanSession::new(media, options, move |scan| {
        // The receiver only goes away during shutdown.
        let _ = scan_tx.send(scan);
    });
    let handle = session.spawn();

    let printer = Printer { json: cli.json };
    let result = drive(&handle.control(), scan_rx, &printer, &cli, &config).await;

    let last = handle.stop().await?;
    printer.emit(&render_status(&last))?;
    result
}

fn media_devices(cli: &Cli) -> Result<Arc<dyn MediaDevices>> {
    if let Some(path) = cli.simulator.as_deref() {
        info!(script = %path.display(), "Using simulated cameras");
        return Ok(Arc::new(SimulatedMediaDevices::from_script(path)?));
    }

    #[cfg(feature = "camera")]
    {
        Ok(Arc::new(ticketscan::V4l2MediaDevices::new()))
    }

    #[cfg(not(feature = "camera"))]
    {
        Err(Error::Config(
            "Built without the `camera` feature; pass --simulator".to_string(),
        ))
    }
}

async fn list_cameras(media: &dyn MediaDevices) -> Result<()> {
    let devices = discover_devices(media).await?;
    if devices.is_empty() {
        println!("No cameras detected");
    } else {
        println!("Discovered cameras:");
        for dev in devices {
            println!("  [{}] {} ({}, {:?})", dev.index, dev.label, dev.id, dev.facing);
        }
    }
    Ok(())
}

/// Pump scans, status changes and operator input until the session should end.
async fn drive(
    control: &SessionControl,
    mut scans: mpsc::UnboundedReceiver<ScanResult>,
    printer: &Printer,
    cli: &Cli,
    config: &TicketscanConfig,
) -> Result<()> {
    let mut status = control.watch();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut reset_timer = ResetTimer::new(config.scan.auto_reset());

    if !cli.json {
        println!("Commands: s = switch camera, c<n> = camera n, r = resume, q = quit, anything else = ticket code");
    }

    loop {
        tokio::select! {
            Some(scan) = scans.recv() => {
                printer.emit(&render_scan(&scan))?;
                if cli.once {
                    return Ok(());
                }
                reset_timer.arm(Instant::now());
            }
            () = reset_timer.fired() => {
                reset_timer.disarm();
                control.reset()?;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let current = status.borrow_and_update().clone();
                printer.emit(&render_status(&current))?;
                if current.state == SessionState::PermissionDenied {
                    return Err(Error::PermissionDenied(
                        current.message.unwrap_or_else(|| "Camera access refused".to_string()),
                    ));
                }
            }
            line = stdin.next_line(), if stdin_open => {
                let Some(line) = line? else {
                    stdin_open = false;
                    continue;
                };
                match Input::parse(&line) {
                    Input::Empty => {}
                    Input::Quit => return Ok(()),
                    Input::Switch => control.request_switch()?,
                    Input::Camera(index) => control.request_switch_to(index)?,
                    Input::Resume => {
                        reset_timer.disarm();
                        control.reset()?;
                    }
                    Input::Code(code) => control.submit(code)?,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, releasing camera");
                return Ok(());
            }
        }
    }
}

/// One line typed by the operator
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Empty,
    Quit,
    Switch,
    /// `c<n>`: open camera `n`
    Camera(usize),
    Resume,
    /// Anything else is a ticket code typed by hand
    Code(String),
}

impl Input {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        match line {
            "" => Self::Empty,
            "q" | "quit" => Self::Quit,
            "s" | "switch" => Self::Switch,
            "r" | "reset" => Self::Resume,
            other => other
                .strip_prefix('c')
                .filter(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|n| n.parse().ok())
                .map_or_else(|| Self::Code(other.to_string()), Self::Camera),
        }
    }
}

/// At most one pending auto-reset; arming again moves the deadline.
struct ResetTimer {
    delay: Option<Duration>,
    deadline: Option<Instant>,
}

impl ResetTimer {
    fn new(delay: Option<Duration>) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    fn arm(&mut self, now: Instant) {
        self.deadline = self.delay.map(|delay| now + delay);
    }

    fn disarm(&mut self) {
        self.deadline = None;
    }

    /// Resolves at the deadline; never while disarmed.
    async fn fired(&self) {
        match self.deadline {
            Some(at) => time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }
}
