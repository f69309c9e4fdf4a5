//! servicehost CLI: hosts the sample units in a console session

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use servicehost::config::{Args, Command, HostConfig};
use servicehost::demo;
use servicehost::logging::{init_logging, LogTarget};
use servicehost::manager::LocalServiceManager;
use servicehost::ServiceHost;

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    match args.command.unwrap_or_default() {
        Command::Console { units, interval } => {
            init_logging(&config, LogTarget::Console)?;
            cmd_console(config, &units, interval)
        }
        Command::SampleConfig => {
            print!("{}", HostConfig::sample_config());
            Ok(())
        }
    }
}

/// Config file first, then command line overrides
fn load_config(args: &Args) -> Result<HostConfig> {
    let mut config = match &args.config {
        Some(path) => HostConfig::load(path)?,
        None => HostConfig::load_default().unwrap_or_else(|e| {
            eprintln!("Warning: Failed to load config: {}, using defaults", e);
            HostConfig::default()
        }),
    };
    if args.verbose > 0 || args.quiet {
        config.log_level = args.log_level().to_string();
    }
    if let Some(log_file) = &args.log {
        config.log_file = log_file.clone();
    }
    Ok(config)
}

/// Host the demo units under the in-process manager until Ctrl+C
fn cmd_console(config: HostConfig, names: &[String], interval: u64) -> Result<()> {
    let units = demo::build_units(names, Duration::from_millis(interval))?;
    let manager = LocalServiceManager::new();

    let controller = manager.controller();
    ctrlc::set_handler(move || {
        info!("Received Ctrl+C, stopping services...");
        controller.stop_all();
    })
    .context("Failed to set Ctrl+C handler")?;

    println!(
        "Hosting {} (press Ctrl+C to stop)",
        units
            .iter()
            .map(|u| u.name())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let host = ServiceHost::with_config(Arc::new(manager), config);
    if let Err(e) = host.run(&units) {
        warn!("Host finished with error: {}", e);
        return Err(e.into());
    }

    println!("All services stopped.");
    Ok(())
}
