//! tracing-subscriber initialization

use crate::config::HostConfig;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Where log lines go when no log file is configured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    /// Interactive run: write to stderr
    Console,
    /// Running under the service manager: there is no console
    Service,
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
///
/// Fails only if a subscriber is already installed.
pub fn init_logging(config: &HostConfig, target: LogTarget) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if !config.log_file.is_empty() {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_file);

        match file {
            Ok(file) => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().with_writer(file).with_ansi(false))
                    .try_init()?;
                return Ok(());
            }
            Err(e) => {
                eprintln!("Warning: Failed to open log file: {}", e);
            }
        }
    }

    match target {
        LogTarget::Console => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init()?,
        LogTarget::Service => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::sink))
            .try_init()?,
    }
    Ok(())
}
