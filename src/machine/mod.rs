//! Service control state machine
//!
//! Each hosted unit owns a status record and maps (state, control) to a
//! synchronous reply plus, usually, a hook deferred to the worker pool.
//! Only interrogate and device query-remove are answered on the
//! control-dispatch thread, which is shared by every unit in the process.

mod context;
mod dispatch;
mod transition;

pub use context::ServiceContext;

pub(crate) use dispatch::DeferredDispatcher;

use crate::config::HostConfig;
use crate::control::{ControlCode, ControlReply, DeviceEvent, DeviceEventTarget};
use crate::device::{DeviceRegistrationTable, DeviceSource};
use crate::error::{HostError, Result, StartFailure, ERROR_EXCEPTION_IN_SERVICE};
use crate::eventlog::{default_event_log, write_best_effort, EventLog, Severity};
use crate::identity::{ServiceIdentity, ServiceName};
use crate::manager::{ControlHandler, ServiceManager, StatusHandle};
use crate::service::{DeviceNotification, Service};
use crate::status::{AcceptedCommands, ServiceKind, ServiceState, StatusCell, StatusRecord};
use anyhow::anyhow;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use transition::{plan, Hook, PendingTransition, Plan};

pub(crate) struct UnitInner {
    identity: ServiceIdentity,
    service: Box<dyn Service>,
    status: StatusCell,
    kind: RwLock<ServiceKind>,
    status_handle: RwLock<Option<Arc<dyn StatusHandle>>>,
    dispatcher: RwLock<Option<DeferredDispatcher>>,
    event_log: RwLock<Arc<dyn EventLog>>,
    auto_log: RwLock<Option<bool>>,
    default_auto_log: AtomicBool,
    wait_hint_ms: AtomicU32,
    devices: DeviceRegistrationTable,
    start_failure: Mutex<Option<StartFailure>>,
    stop_after_start: AtomicBool,
    disposed: AtomicBool,
}

impl UnitInner {
    pub fn name(&self) -> ServiceName {
        self.identity.name()
    }

    fn wait_hint_ms(&self) -> u32 {
        self.wait_hint_ms.load(Ordering::Acquire)
    }

    fn auto_log(&self) -> bool {
        (*self.auto_log.read()).unwrap_or_else(|| self.default_auto_log.load(Ordering::Acquire))
    }

    fn dispatcher(&self) -> Option<DeferredDispatcher> {
        self.dispatcher.read().clone()
    }

    pub fn snapshot(&self) -> StatusRecord {
        self.status
            .snapshot(*self.kind.read(), self.identity.accepted())
    }

    fn log(&self, message: &str, severity: Severity) {
        let log = self.event_log.read().clone();
        write_best_effort(log.as_ref(), self.name().as_str(), message, severity);
    }

    /// Push the status record to the service manager
    pub fn push_status(&self) -> Result<()> {
        self.status_handle()?
            .set_status(&self.snapshot())
            .map_err(|e| HostError::native("SetServiceStatus", e))
    }

    fn push_status_logged(&self) {
        if let Err(e) = self.push_status() {
            warn!(service = %self.name(), "Failed to report status: {}", e);
        }
    }

    fn status_handle(&self) -> Result<Arc<dyn StatusHandle>> {
        self.status_handle.read().clone().ok_or_else(|| {
            HostError::InvalidOperation(format!("service '{}' has not been started", self.name()))
        })
    }

    /// Run a hook, turning panics into errors
    fn invoke(self: &Arc<Self>, hook: &Hook) -> anyhow::Result<()> {
        let ctx = ServiceContext::new(self.clone());
        let service = self.service.as_ref();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match hook {
            Hook::Start(args) => service.on_start(&ctx, args),
            Hook::Stop => service.on_stop(&ctx),
            Hook::Pause => service.on_pause(&ctx),
            Hook::Continue => service.on_continue(&ctx),
            Hook::Shutdown => service.on_shutdown(&ctx),
            Hook::Custom(code) => service.on_custom_command(&ctx, *code),
            Hook::Power(event) => service.on_power_event(&ctx, *event).map(|allow| {
                debug!(service = %ctx.name(), "Power event {:?} answered allow={}", event, allow);
            }),
            Hook::Session(change) => service.on_session_change(&ctx, *change),
            Hook::Device(notification) => {
                service.on_device_notification(&ctx, notification.clone())
            }
        }));
        outcome.unwrap_or_else(|payload| Err(anyhow!("panicked: {}", panic_message(&payload))))
    }

    /// Log the outcome of a hook, publish the settled status and surface failures as faults
    fn finish_hook(
        &self,
        hook: &Hook,
        result: anyhow::Result<()>,
        publish: impl FnOnce(),
    ) -> Result<()> {
        match result {
            Ok(()) => {
                if self.auto_log() {
                    if let Some(message) = hook.success_message() {
                        self.log(message, Severity::Information);
                    }
                }
                publish();
                Ok(())
            }
            Err(e) => {
                let message = format!("{:#}", e);
                self.log(
                    &format!("{} failed: {}", hook.label(), message),
                    Severity::Error,
                );
                publish();
                Err(HostError::ServiceFault {
                    service: self.name().to_string(),
                    hook: hook.label(),
                    message,
                })
            }
        }
    }

    fn record_start_failure(&self, message: String) {
        if self.status.exit_code() == 0 {
            self.status.set_exit_code(ERROR_EXCEPTION_IN_SERVICE);
        }
        *self.start_failure.lock() = Some(StartFailure {
            service: self.name().to_string(),
            message,
        });
    }

    /// Entry point invoked by the service manager's dispatcher
    pub fn service_main(self: &Arc<Self>, manager: &dyn ServiceManager, args: Vec<String>) {
        if self.disposed.load(Ordering::Acquire) {
            warn!(service = %self.name(), "Ignoring start of a disposed service");
            return;
        }
        let Some(dispatcher) = self.dispatcher() else {
            error!(service = %self.name(), "Service started before host initialization");
            return;
        };

        let name = self.name();
        self.status.reset_for_start(self.wait_hint_ms());
        *self.start_failure.lock() = None;

        let weak = Arc::downgrade(self);
        let handler: ControlHandler = Box::new(move |code| match weak.upgrade() {
            Some(unit) => unit.handle_control(code),
            None => ControlReply::NotImplemented,
        });

        match manager.register_control_handler(name.as_str(), handler) {
            Ok(handle) => *self.status_handle.write() = Some(handle),
            Err(e) => {
                error!(service = %name, "Failed to register control handler: {}", e);
                self.record_start_failure(
                    HostError::native("RegisterServiceCtrlHandlerEx", e).to_string(),
                );
                self.status.settle(ServiceState::Stopped);
                return;
            }
        }

        info!(service = %name, "Starting service");
        self.push_status_logged();
        dispatcher.begin_start(self, args);
    }

    fn complete_start(self: &Arc<Self>, hook: Hook) -> Result<()> {
        let result = self.invoke(&hook);
        match &result {
            Ok(()) => self.status.settle(ServiceState::Running),
            Err(e) => {
                self.record_start_failure(format!("{:#}", e));
                self.status.settle(ServiceState::Stopped);
            }
        }
        let outcome = self.finish_hook(&hook, result, || self.push_status_logged());

        if outcome.is_ok() && self.stop_after_start.swap(false, Ordering::AcqRel) {
            debug!(service = %self.name(), "Stop was requested during start");
            self.request_stop()?;
        }
        outcome
    }

    fn fail_start_without_worker(&self) {
        self.record_start_failure("worker pool is not available".to_string());
        self.status.settle(ServiceState::Stopped);
        self.push_status_logged();
    }

    fn complete_transition(
        self: &Arc<Self>,
        transition: PendingTransition,
        hook: Hook,
    ) -> Result<()> {
        let result = self.invoke(&hook);
        let next = if result.is_ok() {
            transition.success
        } else {
            transition.failure
        };
        self.status.settle(next);
        self.finish_hook(&hook, result, || self.push_status_logged())
    }

    /// Programmatic stop from service code
    fn request_stop(self: &Arc<Self>) -> Result<()> {
        let state = self.status.state();
        if let Some(transition) = PendingTransition::stop_from(state) {
            let dispatcher = self
                .dispatcher()
                .ok_or_else(|| HostError::InvalidOperation("service is not hosted".into()))?;
            dispatcher.begin_transition(self, transition, Hook::Stop);
            return Ok(());
        }
        match state {
            ServiceState::StartPending => {
                self.stop_after_start.store(true, Ordering::Release);
                Ok(())
            }
            ServiceState::StopPending | ServiceState::Stopped => Ok(()),
            other => Err(HostError::InvalidOperation(format!(
                "cannot stop a service that is {}",
                other
            ))),
        }
    }

    /// Control handler; runs on the control-dispatch thread
    pub fn handle_control(self: &Arc<Self>, code: ControlCode) -> ControlReply {
        let state = self.status.state();
        debug!(service = %self.name(), control = code.label(), %state, "Control received");

        let plan = plan(state, self.identity.accepted(), code);
        let Some(dispatcher) = self.dispatcher() else {
            return ControlReply::NotImplemented;
        };

        match plan {
            Plan::Report => {
                self.push_status_logged();
                ControlReply::NoError
            }
            Plan::Transition(transition, hook) => {
                dispatcher.begin_transition(self, transition, hook)
            }
            Plan::Shutdown => dispatcher.begin_shutdown(self),
            Plan::Defer(hook) => dispatcher.defer(self, hook),
            Plan::QueryRemove(event) => self.answer_query_remove(event),
            Plan::DeviceNotify(event) => match self.resolve_device(event) {
                Some(notification) => dispatcher.defer(self, Hook::Device(notification)),
                None => ControlReply::NoError,
            },
            Plan::Ignore => ControlReply::NoError,
            Plan::NotAccepted => ControlReply::NotImplemented,
        }
    }

    /// Route a device event to its subscriber; unknown handles are dropped
    fn resolve_device(&self, event: DeviceEvent) -> Option<DeviceNotification> {
        let source = match event.target {
            DeviceEventTarget::Handle(raw) => {
                let Some(registration) = self.devices.lookup(raw) else {
                    debug!(service = %self.name(), "No subscriber for device handle {:#x}", raw);
                    return None;
                };
                DeviceSource::Handle {
                    handle: registration.handle().clone(),
                    token: registration.token().clone(),
                }
            }
            DeviceEventTarget::Interface { class, name } => DeviceSource::Interface { class, name },
        };
        Some(DeviceNotification {
            kind: event.kind,
            source,
        })
    }

    fn answer_query_remove(self: &Arc<Self>, event: DeviceEvent) -> ControlReply {
        let Some(notification) = self.resolve_device(event) else {
            return ControlReply::NoError;
        };
        let ctx = ServiceContext::new(self.clone());
        let answer = panic::catch_unwind(AssertUnwindSafe(|| {
            self.service
                .on_device_query_remove(&ctx, &notification.source)
        }));
        match answer {
            Ok(true) => ControlReply::NoError,
            Ok(false) => ControlReply::Deny,
            Err(payload) => {
                self.log(
                    &format!(
                        "on_device_query_remove failed: panicked: {}",
                        panic_message(&payload)
                    ),
                    Severity::Error,
                );
                ControlReply::NoError
            }
        }
    }

    /// Prepare the unit for a run and freeze its identity
    pub fn initialize(
        &self,
        kind: ServiceKind,
        dispatcher: DeferredDispatcher,
        config: &HostConfig,
    ) -> Result<()> {
        let name = self.name();
        if self.disposed.load(Ordering::Acquire) {
            return Err(HostError::Disposed(name.to_string()));
        }
        if name.is_empty() {
            return Err(HostError::InvalidName {
                name: name.to_string(),
                reason: "a hosted service needs a name",
            });
        }
        self.identity.freeze();
        *self.kind.write() = kind;
        *self.dispatcher.write() = Some(dispatcher);
        self.wait_hint_ms
            .store(config.default_wait_hint_ms, Ordering::Release);
        self.default_auto_log
            .store(config.auto_log, Ordering::Release);
        Ok(())
    }

    pub fn take_start_failure(&self) -> Option<StartFailure> {
        self.start_failure.lock().take()
    }

    /// Release host resources; a disposed unit cannot be run again
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.status_handle.write().take();
        self.dispatcher.write().take();
        debug!(service = %self.name(), "Service disposed");
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A hosted service unit: the state machine plus the service's hooks
#[derive(Clone)]
pub struct ServiceUnit {
    inner: Arc<UnitInner>,
}

impl ServiceUnit {
    /// Create a unit accepting Stop only
    pub fn new<S: Service>(name: &str, service: S) -> Result<Self> {
        let name = ServiceName::new(name)?;
        Ok(Self {
            inner: Arc::new(UnitInner {
                identity: ServiceIdentity::new(name),
                service: Box::new(service),
                status: StatusCell::new(),
                kind: RwLock::new(ServiceKind::OwnProcess),
                status_handle: RwLock::new(None),
                dispatcher: RwLock::new(None),
                event_log: RwLock::new(default_event_log()),
                auto_log: RwLock::new(None),
                default_auto_log: AtomicBool::new(true),
                wait_hint_ms: AtomicU32::new(0),
                devices: DeviceRegistrationTable::new(),
                start_failure: Mutex::new(None),
                stop_after_start: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> String {
        self.inner.name().to_string()
    }

    pub fn set_name(&self, name: &str) -> Result<()> {
        self.inner.identity.set_name(name)
    }

    pub fn accepted_commands(&self) -> AcceptedCommands {
        self.inner.identity.accepted()
    }

    pub fn set_accepted(&self, command: AcceptedCommands, enabled: bool) -> Result<()> {
        self.inner.identity.set_accepted(command, enabled)
    }

    /// Builder-style variant of [`ServiceUnit::set_accepted`]
    pub fn accepting(self, command: AcceptedCommands) -> Result<Self> {
        self.set_accepted(command, true)?;
        Ok(self)
    }

    /// Override the host's auto-log setting for this unit
    pub fn set_auto_log(&self, enabled: bool) -> Result<()> {
        if self.inner.identity.is_frozen() {
            return Err(HostError::Frozen("the auto-log setting"));
        }
        *self.inner.auto_log.write() = Some(enabled);
        Ok(())
    }

    pub fn set_event_log(&self, log: Arc<dyn EventLog>) -> Result<()> {
        if self.inner.identity.is_frozen() {
            return Err(HostError::Frozen("the event log"));
        }
        *self.inner.event_log.write() = log;
        Ok(())
    }

    pub fn status(&self) -> StatusRecord {
        self.inner.snapshot()
    }

    pub fn context(&self) -> ServiceContext {
        ServiceContext::new(self.inner.clone())
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn inner(&self) -> &Arc<UnitInner> {
        &self.inner
    }
}

impl std::fmt::Debug for ServiceUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceUnit")
            .field("name", &self.name())
            .field("state", &self.inner.status.state())
            .finish()
    }
}
