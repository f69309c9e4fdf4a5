//! Event log collaborator
//!
//! Writes are best effort: callers go through [`write_best_effort`], which
//! swallows failures so logging can never block lifecycle progress.

use crate::error::Result;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Severity of an event log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Information,
    Warning,
    Error,
}

/// Destination for lifecycle entries
pub trait EventLog: Send + Sync {
    fn write_entry(&self, source: &str, message: &str, severity: Severity) -> Result<()>;
}

/// Write an entry, discarding any failure
pub fn write_best_effort(log: &dyn EventLog, source: &str, message: &str, severity: Severity) {
    if let Err(e) = log.write_entry(source, message, severity) {
        debug!("Event log write failed for '{}': {}", source, e);
    }
}

/// Event log backed by `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventLog;

impl EventLog for TracingEventLog {
    fn write_entry(&self, source: &str, message: &str, severity: Severity) -> Result<()> {
        match severity {
            Severity::Information => info!(service = source, "{}", message),
            Severity::Warning => warn!(service = source, "{}", message),
            Severity::Error => error!(service = source, "{}", message),
        }
        Ok(())
    }
}

/// Default event log for the current platform
pub fn default_event_log() -> Arc<dyn EventLog> {
    #[cfg(windows)]
    {
        Arc::new(windows_log::WindowsEventLog)
    }
    #[cfg(not(windows))]
    {
        Arc::new(TracingEventLog)
    }
}

#[cfg(windows)]
mod windows_log {
    use super::{EventLog, Severity, TracingEventLog};
    use crate::error::{HostError, NativeError, Result};
    use windows::core::{HSTRING, PCWSTR};
    use windows::Win32::System::EventLog::{
        DeregisterEventSource, RegisterEventSourceW, ReportEventW, EVENTLOG_ERROR_TYPE,
        EVENTLOG_INFORMATION_TYPE, EVENTLOG_WARNING_TYPE,
    };

    /// Application event log, mirrored to tracing
    pub struct WindowsEventLog;

    impl EventLog for WindowsEventLog {
        fn write_entry(&self, source: &str, message: &str, severity: Severity) -> Result<()> {
            TracingEventLog.write_entry(source, message, severity)?;

            let kind = match severity {
                Severity::Information => EVENTLOG_INFORMATION_TYPE,
                Severity::Warning => EVENTLOG_WARNING_TYPE,
                Severity::Error => EVENTLOG_ERROR_TYPE,
            };
            let source = HSTRING::from(source);
            let message = HSTRING::from(message);

            unsafe {
                let handle = RegisterEventSourceW(PCWSTR::null(), &source).map_err(to_host)?;
                let strings = [PCWSTR(message.as_ptr())];
                let reported = ReportEventW(
                    handle,
                    kind,
                    0,
                    0,
                    Default::default(),
                    0,
                    Some(&strings),
                    None,
                );
                let _ = DeregisterEventSource(handle);
                reported.map_err(to_host)
            }
        }
    }

    fn to_host(e: windows::core::Error) -> HostError {
        HostError::native(
            "ReportEvent",
            NativeError::new(e.code().0 as u32, e.message().to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HostError;

    struct FailingLog;

    impl EventLog for FailingLog {
        fn write_entry(&self, _source: &str, _message: &str, _severity: Severity) -> Result<()> {
            Err(HostError::InvalidOperation("log full".into()))
        }
    }

    #[test]
    fn test_best_effort_swallows_failures() {
        write_best_effort(&FailingLog, "svc", "started", Severity::Information);
        write_best_effort(&TracingEventLog, "svc", "started", Severity::Error);
    }
}
