//! Sample units hosted by the binaries

use crate::control::{PowerEvent, SessionChange};
use crate::device::{DeviceInterfaceSubscription, DeviceSource};
use crate::error::{HostError, Result};
use crate::machine::{ServiceContext, ServiceUnit};
use crate::service::{DeviceNotification, Service};
use crate::status::AcceptedCommands;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Custom control that makes the heartbeat unit report its tick count
pub const REPORT_TICKS: u32 = 200;

/// Logs a tick at a fixed interval until stopped; pausing suspends the ticks
pub struct HeartbeatService {
    interval: Duration,
    stop_flag: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatService {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            stop_flag: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            ticks: Arc::new(AtomicU64::new(0)),
            handle: Mutex::new(None),
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    fn join_worker(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("Heartbeat thread panicked");
            }
        }
    }
}

impl Service for HeartbeatService {
    fn on_start(&self, ctx: &ServiceContext, args: &[String]) -> anyhow::Result<()> {
        info!(service = %ctx.name(), "Heartbeat starting with args {:?}", args);
        self.stop_flag.store(false, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);

        let stop_flag = self.stop_flag.clone();
        let paused = self.paused.clone();
        let ticks = self.ticks.clone();
        let interval = self.interval;
        let name = ctx.name();
        let handle = thread::Builder::new()
            .name(format!("heartbeat-{}", name))
            .spawn(move || {
                while !stop_flag.load(Ordering::SeqCst) {
                    if !paused.load(Ordering::SeqCst) {
                        let n = ticks.fetch_add(1, Ordering::Relaxed) + 1;
                        debug!(service = %name, "tick {}", n);
                    }
                    thread::sleep(interval);
                }
            })?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    fn on_stop(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        self.join_worker();
        info!(service = %ctx.name(), "Heartbeat stopped after {} ticks", self.ticks());
        Ok(())
    }

    fn on_pause(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn on_continue(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn on_shutdown(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        self.join_worker();
        Ok(())
    }

    fn on_custom_command(&self, ctx: &ServiceContext, code: u32) -> anyhow::Result<()> {
        if code == REPORT_TICKS {
            info!(service = %ctx.name(), "{} ticks so far", self.ticks());
        }
        Ok(())
    }
}

/// Logs every control it receives and watches all device interfaces
#[derive(Default)]
pub struct EchoService {
    interfaces: Mutex<Option<DeviceInterfaceSubscription>>,
}

impl Service for EchoService {
    fn on_start(&self, ctx: &ServiceContext, _args: &[String]) -> anyhow::Result<()> {
        match ctx.register_all_device_interfaces() {
            Ok(subscription) => *self.interfaces.lock() = Some(subscription),
            // Not every service manager delivers device events
            Err(e) => warn!(service = %ctx.name(), "Device interface events unavailable: {}", e),
        }
        Ok(())
    }

    fn on_stop(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        if let Some(subscription) = self.interfaces.lock().take() {
            subscription.dispose();
        }
        info!(service = %ctx.name(), "Echo stopped");
        Ok(())
    }

    fn on_custom_command(&self, ctx: &ServiceContext, code: u32) -> anyhow::Result<()> {
        info!(service = %ctx.name(), "Custom command {}", code);
        Ok(())
    }

    fn on_power_event(&self, ctx: &ServiceContext, event: PowerEvent) -> anyhow::Result<bool> {
        info!(service = %ctx.name(), "Power event {:?}", event);
        Ok(true)
    }

    fn on_session_change(&self, ctx: &ServiceContext, change: SessionChange) -> anyhow::Result<()> {
        info!(
            service = %ctx.name(),
            "Session {} changed: {:?}",
            change.session_id,
            change.reason
        );
        Ok(())
    }

    fn on_device_notification(
        &self,
        ctx: &ServiceContext,
        notification: DeviceNotification,
    ) -> anyhow::Result<()> {
        match &notification.source {
            DeviceSource::Interface { class, name } => info!(
                service = %ctx.name(),
                "Device {:?} on interface {} ({})",
                notification.kind,
                class,
                name.as_deref().unwrap_or("unnamed")
            ),
            DeviceSource::Handle { handle, .. } => info!(
                service = %ctx.name(),
                "Device {:?} on handle {:#x}",
                notification.kind,
                handle.raw_value()
            ),
        }
        Ok(())
    }
}

/// Build the named demo units
pub fn build_units(names: &[String], interval: Duration) -> Result<Vec<ServiceUnit>> {
    names
        .iter()
        .map(|name| match name.as_str() {
            "heartbeat" => ServiceUnit::new("heartbeat", HeartbeatService::new(interval))?
                .accepting(AcceptedCommands::PAUSE_CONTINUE | AcceptedCommands::SHUTDOWN),
            "echo" => ServiceUnit::new("echo", EchoService::default())?.accepting(
                AcceptedCommands::SHUTDOWN
                    | AcceptedCommands::POWER_EVENT
                    | AcceptedCommands::SESSION_CHANGE,
            ),
            other => Err(HostError::InvalidOperation(format!(
                "unknown demo unit '{}' (expected heartbeat or echo)",
                other
            ))),
        })
        .collect()
}
