//! Windows Service Control Manager backend
//!
//! Built on `windows-service`, which exposes one dispatch entry per process
//! and no device-event controls. Multi-unit dispatch tables and native
//! device notifications are reported as not implemented.

use super::{
    ControlHandler, DeviceNotifier, DispatchEntry, NativeResult, NotificationFilter,
    NotificationHandle, ServiceMain, ServiceManager, StatusHandle,
};
use crate::control::{
    ControlCode, ControlReply, PowerEvent, SessionChange, SessionChangeReason,
    BROADCAST_QUERY_DENY,
};
use crate::error::{NativeError, ERROR_CALL_NOT_IMPLEMENTED};
use crate::status::{ServiceKind, ServiceState, StatusRecord};
use parking_lot::Mutex;
use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};
use windows_service::{
    define_windows_service,
    service::{
        PowerEventParam, ServiceControl, ServiceControlAccept, ServiceExitCode,
        ServiceState as ScmState, ServiceStatus, ServiceType,
    },
    service_control_handler::{self, ServiceControlHandlerResult, ServiceStatusHandle},
    service_dispatcher,
};

/// Entry point waiting for the SCM to call `ffi_service_main`
static ENTRY: Mutex<Option<Arc<ServiceMain>>> = parking_lot::const_mutex(None);

define_windows_service!(ffi_service_main, scm_service_main);

fn scm_service_main(arguments: Vec<OsString>) {
    let Some(main) = ENTRY.lock().clone() else {
        error!("Service entry point called without a dispatch entry");
        return;
    };
    let args = arguments
        .into_iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    main(args);
}

fn native(e: windows_service::Error) -> NativeError {
    let code = match &e {
        windows_service::Error::Winapi(io) => io.raw_os_error().unwrap_or(0) as u32,
        _ => 0,
    };
    NativeError::new(code, e.to_string())
}

/// Service manager backed by the Windows SCM
#[derive(Debug, Default, Clone, Copy)]
pub struct ScmServiceManager;

impl ScmServiceManager {
    pub fn new() -> Self {
        Self
    }
}

impl ServiceManager for ScmServiceManager {
    fn run_dispatcher(&self, entries: Vec<DispatchEntry>) -> NativeResult<()> {
        let mut entries = entries.into_iter();
        let (Some(entry), None) = (entries.next(), entries.next()) else {
            return Err(NativeError::new(
                ERROR_CALL_NOT_IMPLEMENTED,
                "the SCM backend hosts exactly one service per process",
            ));
        };

        *ENTRY.lock() = Some(Arc::new(entry.main));
        debug!("Starting SCM dispatcher for '{}'", entry.name);
        let result = service_dispatcher::start(&entry.name, ffi_service_main).map_err(native);
        ENTRY.lock().take();
        result
    }

    fn register_control_handler(
        &self,
        name: &str,
        handler: ControlHandler,
    ) -> NativeResult<Arc<dyn StatusHandle>> {
        let handle = service_control_handler::register(name, move |control| {
            match to_control_code(control) {
                Some(code) => to_handler_result(handler(code)),
                None => ServiceControlHandlerResult::NotImplemented,
            }
        })
        .map_err(native)?;
        Ok(Arc::new(ScmStatusHandle { handle }))
    }
}

fn to_control_code(control: ServiceControl) -> Option<ControlCode> {
    let code = match control {
        ServiceControl::Stop => ControlCode::Stop,
        ServiceControl::Pause => ControlCode::Pause,
        ServiceControl::Continue => ControlCode::Continue,
        ServiceControl::Shutdown => ControlCode::Shutdown,
        ServiceControl::Interrogate => ControlCode::Interrogate,
        ServiceControl::UserEvent(code) => ControlCode::Custom(code.to_raw()),
        ServiceControl::PowerEvent(param) => ControlCode::PowerEvent(to_power_event(&param)),
        ServiceControl::SessionChange(param) => ControlCode::SessionChange(SessionChange {
            reason: SessionChangeReason::from_raw(param.reason as u32),
            session_id: param.notification.session_id,
        }),
        _ => return None,
    };
    Some(code)
}

fn to_power_event(param: &PowerEventParam) -> PowerEvent {
    match param {
        PowerEventParam::QuerySuspend => PowerEvent::QuerySuspend,
        PowerEventParam::QuerySuspendFailed => PowerEvent::QuerySuspendFailed,
        PowerEventParam::Suspend => PowerEvent::Suspend,
        PowerEventParam::ResumeCritical => PowerEvent::ResumeCritical,
        PowerEventParam::ResumeSuspend => PowerEvent::ResumeSuspend,
        PowerEventParam::ResumeAutomatic => PowerEvent::ResumeAutomatic,
        PowerEventParam::BatteryLow => PowerEvent::BatteryLow,
        PowerEventParam::PowerStatusChange => PowerEvent::PowerStatusChange,
        PowerEventParam::OemEvent => PowerEvent::OemEvent,
        PowerEventParam::PowerSettingChange(_) => PowerEvent::PowerSettingChange,
        #[allow(unreachable_patterns)]
        _ => PowerEvent::Other(0),
    }
}

fn to_handler_result(reply: ControlReply) -> ServiceControlHandlerResult {
    match reply {
        ControlReply::NoError => ServiceControlHandlerResult::NoError,
        ControlReply::NotImplemented => ServiceControlHandlerResult::NotImplemented,
        ControlReply::Deny => ServiceControlHandlerResult::Other(BROADCAST_QUERY_DENY),
    }
}

fn to_scm_state(state: ServiceState) -> ScmState {
    match state {
        ServiceState::StartPending => ScmState::StartPending,
        ServiceState::Running => ScmState::Running,
        ServiceState::PausePending => ScmState::PausePending,
        ServiceState::Paused => ScmState::Paused,
        ServiceState::ContinuePending => ScmState::ContinuePending,
        ServiceState::StopPending => ScmState::StopPending,
        ServiceState::Stopped => ScmState::Stopped,
    }
}

fn to_service_status(record: &StatusRecord) -> ServiceStatus {
    ServiceStatus {
        service_type: match record.kind {
            ServiceKind::OwnProcess => ServiceType::OWN_PROCESS,
            ServiceKind::ShareProcess => ServiceType::SHARE_PROCESS,
        },
        current_state: to_scm_state(record.current_state),
        controls_accepted: ServiceControlAccept::from_bits_truncate(record.accepted.bits()),
        exit_code: ServiceExitCode::Win32(record.exit_code),
        checkpoint: record.checkpoint,
        wait_hint: Duration::from_millis(u64::from(record.wait_hint_ms)),
        process_id: None,
    }
}

struct ScmStatusHandle {
    handle: ServiceStatusHandle,
}

impl StatusHandle for ScmStatusHandle {
    fn set_status(&self, status: &StatusRecord) -> NativeResult<()> {
        self.handle
            .set_service_status(to_service_status(status))
            .map_err(native)
    }

    fn device_notifier(&self) -> Arc<dyn DeviceNotifier> {
        Arc::new(UnsupportedNotifier)
    }
}

struct UnsupportedNotifier;

impl DeviceNotifier for UnsupportedNotifier {
    fn register(&self, _filter: NotificationFilter) -> NativeResult<NotificationHandle> {
        Err(NativeError::new(
            ERROR_CALL_NOT_IMPLEMENTED,
            "device notifications are not available under the SCM backend",
        ))
    }

    fn unregister(&self, _handle: NotificationHandle) -> NativeResult<()> {
        Err(NativeError::new(
            ERROR_CALL_NOT_IMPLEMENTED,
            "device notifications are not available under the SCM backend",
        ))
    }
}
