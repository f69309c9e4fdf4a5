//! Seam to the OS service manager and device-notification subsystem
//!
//! The host never talks to the OS directly. `ServiceManager` runs the
//! dispatch table and registers control handlers, `StatusHandle` receives
//! status pushes, and `DeviceNotifier` hands out notification handles.

pub mod local;
#[cfg(all(windows, feature = "service"))]
pub mod windows;

use crate::control::{ControlCode, ControlReply};
use crate::device::{InterfaceFilter, RawHandle};
use crate::error::NativeError;
use crate::status::StatusRecord;
use std::sync::Arc;

pub use local::{LocalController, LocalServiceManager};

/// Result of a call into an OS collaborator
pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Callback invoked on the control-dispatch thread for every control request
pub type ControlHandler = Box<dyn Fn(ControlCode) -> ControlReply + Send + Sync>;

/// Entry point invoked by the dispatcher with the start arguments
pub type ServiceMain = Box<dyn Fn(Vec<String>) + Send + Sync>;

/// One row of the dispatch table
pub struct DispatchEntry {
    pub name: String,
    pub main: ServiceMain,
}

/// The OS service-manager dispatch mechanism
pub trait ServiceManager: Send + Sync {
    /// Register the dispatch table and block until every hosted unit has stopped.
    fn run_dispatcher(&self, entries: Vec<DispatchEntry>) -> NativeResult<()>;

    /// Register the control handler of a unit and get its status handle.
    fn register_control_handler(
        &self,
        name: &str,
        handler: ControlHandler,
    ) -> NativeResult<Arc<dyn StatusHandle>>;
}

/// Handle returned by control handler registration
pub trait StatusHandle: Send + Sync {
    /// Push a status record to the service manager.
    fn set_status(&self, status: &StatusRecord) -> NativeResult<()>;

    /// Notification subsystem scoped to this unit as recipient.
    fn device_notifier(&self) -> Arc<dyn DeviceNotifier>;
}

/// Filter passed to the native notification subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationFilter {
    Handle(RawHandle),
    Interface(InterfaceFilter),
}

/// Owned native notification registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationHandle(pub u64);

/// The OS device-notification subsystem
pub trait DeviceNotifier: Send + Sync {
    fn register(&self, filter: NotificationFilter) -> NativeResult<NotificationHandle>;

    fn unregister(&self, handle: NotificationHandle) -> NativeResult<()>;
}
