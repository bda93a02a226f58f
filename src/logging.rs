//! `tracing` subscriber setup for the daemon
//!
//! Logs go to stderr so that stdout stays reserved for scan events.

use crate::config::{LogRotation, LoggingOptions};
use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::OnceLock;
use tracing_appender::non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber. A no-op if one is already set.
pub fn init(options: &LoggingOptions) -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = build_filter(&options.level)?;

    let mut layers = vec![console_layer(options.color)];
    if let Some(path) = options.file.as_deref() {
        let writer = file_writer(path, options.rotation)?;
        layers.push(file_layer(writer));
    }

    Registry::default()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))
}

/// `TICKETSCAN_LOG_LEVEL` wins over the configured directives.
fn build_filter(configured: &str) -> Result<EnvFilter> {
    let directives =
        std::env::var("TICKETSCAN_LOG_LEVEL").unwrap_or_else(|_| configured.to_string());
    EnvFilter::try_new(&directives)
        .map_err(|e| Error::Config(format!("Invalid log level '{directives}': {e}")))
}

fn console_layer(color: bool) -> BoxedLayer {
    fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_writer(io::stderr)
        .with_ansi(color)
        .with_target(true)
        .boxed()
}

fn file_layer(writer: NonBlocking) -> BoxedLayer {
    fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .boxed()
}

fn file_writer(path: &Path, rotation: Option<LogRotation>) -> Result<NonBlocking> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| {
        Error::Config(format!("Failed to create log directory {}: {e}", dir.display()))
    })?;

    let builder = NonBlockingBuilder::default().lossy(false);
    let (writer, guard) = match rotation {
        Some(rotation) => {
            let prefix = path.file_name().ok_or_else(|| {
                Error::Config(format!(
                    "Rotated log path '{}' needs a file name",
                    path.display()
                ))
            })?;
            let appender = match rotation {
                LogRotation::Hourly => rolling::hourly(dir, prefix),
                LogRotation::Daily => rolling::daily(dir, prefix),
            };
            builder.finish(appender)
        }
        None => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    Error::Config(format!("Failed to open log file {}: {e}", path.display()))
                })?;
            builder.finish(file)
        }
    };

    // Flushing stops once this guard is dropped.
    let _ = FILE_GUARD.set(guard);
    Ok(writer)
}
