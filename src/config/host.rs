//! Host configuration file support

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// What happens when a deferred service callback fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultPolicy {
    /// Log the fault and keep the process alive
    #[default]
    Log,
    /// Abort the process, like an unhandled native exception
    Abort,
}

/// Host configuration loaded from TOML file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Log file path (empty = no file logging)
    pub log_file: String,

    /// Threads executing deferred service callbacks
    pub worker_threads: usize,

    /// Deferred callbacks queued before overflow threads are used
    pub queue_capacity: usize,

    /// Wait hint announced when a unit enters a pending state
    pub default_wait_hint_ms: u32,

    /// Write lifecycle entries to the event log
    pub auto_log: bool,

    /// Policy for unhandled service faults
    pub fault_policy: FaultPolicy,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: String::new(),
            worker_threads: 4,
            queue_capacity: 64,
            default_wait_hint_ms: 30_000,
            auto_log: true,
            fault_policy: FaultPolicy::Log,
        }
    }
}

impl HostConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_string_lossy().to_string(),
            source: e,
        })
    }

    /// Load configuration from default locations
    ///
    /// Searches in order:
    /// 1. Same directory as executable: servicehost.toml
    /// 2. User config directory: servicehost/config.toml
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let config_path = exe_dir.join("servicehost.toml");
                if config_path.exists() {
                    return Self::load(&config_path);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join("servicehost").join("config.toml");
            if config_path.exists() {
                return Self::load(&config_path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.to_string_lossy().to_string(),
                source: e,
            })?;
        }

        std::fs::write(path, content).map_err(|e| ConfigError::Io {
            path: path.to_string_lossy().to_string(),
            source: e,
        })
    }

    /// Generate a sample configuration file content
    pub fn sample_config() -> String {
        r#"# servicehost configuration

# Log level: trace, debug, info, warn, error (default: info)
log_level = "info"

# Log file path (empty = no file logging)
# Example: log_file = "C:\\ProgramData\\servicehost\\host.log"
log_file = ""

# Threads executing deferred service callbacks (default: 4)
worker_threads = 4

# Callbacks queued before overflow threads are used (default: 64)
queue_capacity = 64

# Wait hint in milliseconds announced on entering a pending state (default: 30000)
default_wait_hint_ms = 30000

# Write start/stop/pause/continue entries to the event log (default: true)
auto_log = true

# Unhandled service faults: "log" or "abort" (default: log)
fault_policy = "log"
"#
        .to_string()
    }
}

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error reading/writing config file
    #[error("Failed to access config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// Error parsing TOML
    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    /// Error serializing config
    #[error("Failed to serialize config: {0}")]
    Serialize(#[source] toml::ser::Error),
}
