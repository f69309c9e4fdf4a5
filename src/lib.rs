//! servicehost - Windows service hosting runtime
//!
//! Hosts one or more service units in a process, drives each through the
//! service control state machine, defers lifecycle hooks to a worker pool
//! and routes device notifications to the units that asked for them.

pub mod config;
pub mod control;
pub mod demo;
pub mod device;
pub mod error;
pub mod eventlog;
pub mod host;
pub mod identity;
pub mod logging;
pub mod machine;
pub mod manager;
pub mod service;
pub mod status;
pub mod worker;

pub use control::{ControlCode, ControlReply};
pub use error::{HostError, Result};
pub use host::ServiceHost;
pub use machine::{ServiceContext, ServiceUnit};
pub use service::Service;
pub use status::{AcceptedCommands, ServiceState, StatusRecord};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
