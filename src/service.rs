//! Lifecycle hooks implemented by a hosted service

use crate::control::{DeviceEventKind, PowerEvent, SessionChange};
use crate::device::DeviceSource;
use crate::machine::ServiceContext;

/// A device notification delivered to [`Service::on_device_notification`]
#[derive(Debug, Clone)]
pub struct DeviceNotification {
    pub kind: DeviceEventKind,
    pub source: DeviceSource,
}

/// Behaviour of a hosted unit.
///
/// Every hook except [`Service::on_device_query_remove`] runs on a worker
/// thread. Returning an error rolls the unit back as described on each hook
/// and is reported as a service fault.
pub trait Service: Send + Sync + 'static {
    /// Start the service. An error leaves the unit Stopped with a non-zero exit code.
    fn on_start(&self, ctx: &ServiceContext, args: &[String]) -> anyhow::Result<()>;

    /// Stop the service. An error restores the state the unit was in before StopPending.
    fn on_stop(&self, ctx: &ServiceContext) -> anyhow::Result<()>;

    /// An error returns the unit to Running.
    fn on_pause(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// An error returns the unit to Paused.
    fn on_continue(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// The system is shutting down; the unit is Stopped afterwards either way.
    fn on_shutdown(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_custom_command(&self, _ctx: &ServiceContext, _code: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Returns whether the power request is allowed
    fn on_power_event(&self, _ctx: &ServiceContext, _event: PowerEvent) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn on_session_change(
        &self,
        _ctx: &ServiceContext,
        _change: SessionChange,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_device_notification(
        &self,
        _ctx: &ServiceContext,
        _notification: DeviceNotification,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Answer a query-remove on the control-dispatch thread; `false` vetoes the removal.
    ///
    /// Must return promptly: every hosted unit shares the dispatch thread.
    fn on_device_query_remove(&self, _ctx: &ServiceContext, _source: &DeviceSource) -> bool {
        true
    }
}
