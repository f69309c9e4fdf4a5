//! servicehost Windows service executable
//!
//! Hosts the heartbeat unit under the Service Control Manager. Install it
//! with `sc create heartbeat binPath= <path to this exe>` and start it with
//! `sc start heartbeat`; running it from a console fails to connect to the SCM.

#[cfg(windows)]
fn main() -> anyhow::Result<()> {
    use servicehost::config::HostConfig;
    use servicehost::logging::{init_logging, LogTarget};
    use servicehost::manager::windows::ScmServiceManager;
    use servicehost::{demo, ServiceHost};
    use std::sync::Arc;
    use std::time::Duration;
    use tracing::{error, info};

    let config = HostConfig::load_default().unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config: {}, using defaults", e);
        HostConfig::default()
    });
    init_logging(&config, LogTarget::Service)?;

    let units = demo::build_units(&["heartbeat".to_string()], Duration::from_secs(1))?;
    let host = ServiceHost::with_config(Arc::new(ScmServiceManager::new()), config);

    info!("servicehost {} starting", servicehost::VERSION);
    host.run(&units).map_err(|e| {
        error!("Service host failed: {}", e);
        e
    })?;
    Ok(())
}

#[cfg(not(windows))]
fn main() {
    eprintln!("servicehost-service only runs under the Windows Service Control Manager");
    std::process::exit(1);
}
