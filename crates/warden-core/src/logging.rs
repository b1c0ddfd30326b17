//! Tracing integration for structured logging.
//!
//! Shared logging setup for broker processes and tests:
//! - Configurable verbosity levels
//! - Optional file output
//! - JSON or text format

use std::path::Path;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::Result;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

/// Initialize the logging system.
///
/// `verbosity` maps 0=error, 1=warn, 2=info, 3=debug, 4+=trace.
/// `RUST_LOG` overrides the computed filter when set.
pub fn init_logging(verbosity: u8, log_file: Option<&Path>, format: LogFormat) -> Result<()> {
    let level = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("warden_core={level},warden_broker={level}"))
    });

    let registry = tracing_subscriber::registry().with(filter);

    match (log_file, format) {
        (None, LogFormat::Text) => registry
            .with(fmt::layer().with_target(true))
            .try_init()
            .map_err(|e| crate::Error::Io(std::io::Error::other(e.to_string())))?,
        (None, LogFormat::Json) => registry
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| crate::Error::Io(std::io::Error::other(e.to_string())))?,
        (Some(path), format) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let layer = fmt::layer().with_writer(file).with_ansi(false);
            match format {
                LogFormat::Text => registry
                    .with(layer)
                    .try_init()
                    .map_err(|e| crate::Error::Io(std::io::Error::other(e.to_string())))?,
                LogFormat::Json => registry
                    .with(layer.json())
                    .try_init()
                    .map_err(|e| crate::Error::Io(std::io::Error::other(e.to_string())))?,
            }
        }
    }

    Ok(())
}

/// Initialize logging with defaults for testing.
///
/// Silently ignores errors (logging may already be initialized).
pub fn init_test_logging() {
    let _ = init_logging(2, None, LogFormat::Text);
}
