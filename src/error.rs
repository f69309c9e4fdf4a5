//! Unified error types for servicehost

use crate::config::ConfigError;
use std::fmt;
use thiserror::Error;

/// The function is not supported by the service manager
pub const ERROR_CALL_NOT_IMPLEMENTED: u32 = 120;
/// The service has not been started
pub const ERROR_SERVICE_NOT_ACTIVE: u32 = 1062;
/// The service process could not connect to the service controller
pub const ERROR_FAILED_SERVICE_CONTROLLER_CONNECT: u32 = 1063;
/// An exception occurred in the service when handling the control request
pub const ERROR_EXCEPTION_IN_SERVICE: u32 = 1064;

/// Error reported by an OS collaborator, carrying the native error code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (os error {code})")]
pub struct NativeError {
    /// Native error code (Win32 error space)
    pub code: u32,
    /// Human readable description
    pub message: String,
}

impl NativeError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A unit whose start hook failed, captured for the caller of `ServiceHost::run`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartFailure {
    pub service: String,
    pub message: String,
}

impl fmt::Display for StartFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.service, self.message)
    }
}

/// Main error type for servicehost operations
#[derive(Error, Debug)]
pub enum HostError {
    /// Service name failed validation
    #[error("Invalid service name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// Property changed after the unit began initialization
    #[error("Cannot change {0} once the service has been initialized")]
    Frozen(&'static str),

    /// Operation not legal in the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// `run` was called without any units
    #[error("No services were supplied to run")]
    NoServices,

    /// Two units in one run share a name
    #[error("Duplicate service name: {0}")]
    DuplicateName(String),

    /// The unit was disposed by an earlier run
    #[error("Service '{0}' has been disposed and cannot be run again")]
    Disposed(String),

    /// A live subscription already exists for the raw device handle
    #[error("Device handle {0:#x} is already registered")]
    DuplicateDevice(u64),

    /// A native subsystem call failed
    #[error("{context} failed: {source}")]
    Native {
        context: &'static str,
        #[source]
        source: NativeError,
    },

    /// The service manager dispatch call itself failed
    #[error("Service dispatcher failed: {0}")]
    Dispatcher(#[source] NativeError),

    /// One or more units failed to start
    #[error("Service start failed: {}", join_failures(.0))]
    StartFailed(Vec<StartFailure>),

    /// A lifecycle hook returned an error or panicked
    #[error("Service '{service}' failed in {hook}: {message}")]
    ServiceFault {
        service: String,
        hook: &'static str,
        message: String,
    },

    /// The worker pool no longer accepts work
    #[error("Worker pool has been shut down")]
    WorkerPoolClosed,

    /// Configuration file error
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type alias for servicehost operations
pub type Result<T> = std::result::Result<T, HostError>;

fn join_failures(failures: &[StartFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl HostError {
    /// Wrap a native error with the name of the failed call
    pub fn native(context: &'static str, source: NativeError) -> Self {
        Self::Native { context, source }
    }

    /// Short stable label for log fields
    pub fn as_label(&self) -> &'static str {
        match self {
            HostError::InvalidName { .. } => "invalid_name",
            HostError::Frozen(_) => "frozen",
            HostError::InvalidOperation(_) => "invalid_operation",
            HostError::NoServices => "no_services",
            HostError::DuplicateName(_) => "duplicate_name",
            HostError::Disposed(_) => "disposed",
            HostError::DuplicateDevice(_) => "duplicate_device",
            HostError::Native { .. } => "native",
            HostError::Dispatcher(_) => "dispatcher",
            HostError::StartFailed(_) => "start_failed",
            HostError::ServiceFault { .. } => "service_fault",
            HostError::WorkerPoolClosed => "worker_pool_closed",
            HostError::Config(_) => "config",
        }
    }

    /// Native error code carried by this error, if any
    pub fn native_code(&self) -> Option<u32> {
        match self {
            HostError::Native { source, .. } | HostError::Dispatcher(source) => Some(source.code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_code_is_preserved() {
        let err = HostError::native("RegisterDeviceNotification", NativeError::new(5, "denied"));
        assert_eq!(err.native_code(), Some(5));
        assert_eq!(err.as_label(), "native");
        assert_eq!(
            err.to_string(),
            "RegisterDeviceNotification failed: denied (os error 5)"
        );
    }

    #[test]
    fn test_start_failed_lists_every_unit() {
        let err = HostError::StartFailed(vec![
            StartFailure {
                service: "a".into(),
                message: "boom".into(),
            },
            StartFailure {
                service: "b".into(),
                message: "bang".into(),
            },
        ]);
        assert_eq!(err.to_string(), "Service start failed: a: boom; b: bang");
        assert_eq!(err.native_code(), None);
    }
}
