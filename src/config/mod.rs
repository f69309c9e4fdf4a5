//! Configuration: host settings file and command line

mod args;
mod host;

pub use args::{Args, Command};
pub use host::{ConfigError, FaultPolicy, HostConfig};
