//! Handle given to lifecycle hooks for talking back to the host

use super::UnitInner;
use crate::device::{
    DeviceHandle, DeviceInterfaceSubscription, DeviceSubscription, DeviceToken, Guid,
    InterfaceFilter,
};
use crate::error::Result;
use crate::eventlog::Severity;
use crate::status::{ServiceState, StatusRecord};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct ServiceContext {
    inner: Arc<UnitInner>,
}

impl ServiceContext {
    pub(crate) fn new(inner: Arc<UnitInner>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> String {
        self.inner.name().to_string()
    }

    pub fn status(&self) -> StatusRecord {
        self.inner.snapshot()
    }

    pub fn state(&self) -> ServiceState {
        self.inner.status.state()
    }

    /// Ask the service manager for more time while in a pending state.
    ///
    /// Sets the wait hint, bumps the checkpoint and pushes the status.
    /// Fails with `InvalidOperation` outside the pending states.
    pub fn request_additional_time(&self, milliseconds: u32) -> Result<()> {
        // Fail before touching the record if nothing can receive the push
        self.inner.status_handle()?;
        let checkpoint = self.inner.status.request_more_time(milliseconds)?;
        debug!(
            service = %self.inner.name(),
            checkpoint,
            "Requested {} ms additional time",
            milliseconds
        );
        self.inner.push_status()
    }

    /// Stop the unit as if the service manager had sent Stop.
    ///
    /// During StartPending the stop runs as soon as start succeeds.
    pub fn stop(&self) -> Result<()> {
        self.inner.request_stop()
    }

    /// Exit code reported to the service manager
    pub fn set_exit_code(&self, code: u32) {
        self.inner.status.set_exit_code(code);
    }

    pub fn exit_code(&self) -> u32 {
        self.inner.status.exit_code()
    }

    /// Receive events for `handle`; the handle stays pinned until the subscription is disposed
    pub fn register_device_notifications(
        &self,
        handle: Arc<dyn DeviceHandle>,
        token: DeviceToken,
    ) -> Result<DeviceSubscription> {
        let notifier = self.inner.status_handle()?.device_notifier();
        self.inner.devices.subscribe(handle, token, notifier)
    }

    /// Receive events for one device interface class
    pub fn register_device_interface(&self, class: Guid) -> Result<DeviceInterfaceSubscription> {
        self.register_interfaces(InterfaceFilter::Class(class))
    }

    /// Receive events for every device interface class
    pub fn register_all_device_interfaces(&self) -> Result<DeviceInterfaceSubscription> {
        self.register_interfaces(InterfaceFilter::AllClasses)
    }

    fn register_interfaces(&self, filter: InterfaceFilter) -> Result<DeviceInterfaceSubscription> {
        let notifier = self.inner.status_handle()?.device_notifier();
        DeviceInterfaceSubscription::subscribe(filter, notifier)
    }

    /// Write to the unit's event log; failures are ignored
    pub fn write_event(&self, message: &str, severity: Severity) {
        self.inner.log(message, severity);
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("name", &self.name())
            .finish()
    }
}
