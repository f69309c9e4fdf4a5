//! Control requests delivered by the service manager and the replies sent back

use crate::device::{Guid, RawHandle};
use crate::error::ERROR_CALL_NOT_IMPLEMENTED;

/// Answer that denies a device query-remove (`BROADCAST_QUERY_DENY`)
pub const BROADCAST_QUERY_DENY: u32 = 0x424D_5144;

/// A control request for one hosted unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCode {
    Stop,
    Pause,
    Continue,
    Shutdown,
    Interrogate,
    /// User-defined control code
    Custom(u32),
    DeviceEvent(DeviceEvent),
    PowerEvent(PowerEvent),
    SessionChange(SessionChange),
}

impl ControlCode {
    /// Short name used in log fields
    pub fn label(&self) -> &'static str {
        match self {
            ControlCode::Stop => "stop",
            ControlCode::Pause => "pause",
            ControlCode::Continue => "continue",
            ControlCode::Shutdown => "shutdown",
            ControlCode::Interrogate => "interrogate",
            ControlCode::Custom(_) => "custom",
            ControlCode::DeviceEvent(_) => "device_event",
            ControlCode::PowerEvent(_) => "power_event",
            ControlCode::SessionChange(_) => "session_change",
        }
    }
}

/// Reply returned synchronously from the control handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlReply {
    NoError,
    NotImplemented,
    /// Veto of a device query-remove
    Deny,
}

impl ControlReply {
    /// Native code handed back to the service manager
    pub fn code(self) -> u32 {
        match self {
            ControlReply::NoError => 0,
            ControlReply::NotImplemented => ERROR_CALL_NOT_IMPLEMENTED,
            ControlReply::Deny => BROADCAST_QUERY_DENY,
        }
    }
}

/// Kind of device broadcast (`DBT_*`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    Arrival,
    QueryRemove,
    QueryRemoveFailed,
    RemovePending,
    RemoveComplete,
    CustomEvent,
    Other(u32),
}

impl DeviceEventKind {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0x8000 => DeviceEventKind::Arrival,
            0x8001 => DeviceEventKind::QueryRemove,
            0x8002 => DeviceEventKind::QueryRemoveFailed,
            0x8003 => DeviceEventKind::RemovePending,
            0x8004 => DeviceEventKind::RemoveComplete,
            0x8006 => DeviceEventKind::CustomEvent,
            other => DeviceEventKind::Other(other),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            DeviceEventKind::Arrival => 0x8000,
            DeviceEventKind::QueryRemove => 0x8001,
            DeviceEventKind::QueryRemoveFailed => 0x8002,
            DeviceEventKind::RemovePending => 0x8003,
            DeviceEventKind::RemoveComplete => 0x8004,
            DeviceEventKind::CustomEvent => 0x8006,
            DeviceEventKind::Other(raw) => raw,
        }
    }
}

/// What a device broadcast refers to, as delivered by the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEventTarget {
    /// A handle-scoped event; routed through the registration table
    Handle(RawHandle),
    /// An interface-class event carrying the class and optional device name
    Interface { class: Guid, name: Option<String> },
}

/// Payload of a device event control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    pub target: DeviceEventTarget,
}

impl DeviceEvent {
    pub fn for_handle(kind: DeviceEventKind, raw: RawHandle) -> Self {
        Self {
            kind,
            target: DeviceEventTarget::Handle(raw),
        }
    }

    pub fn for_interface(kind: DeviceEventKind, class: Guid, name: Option<String>) -> Self {
        Self {
            kind,
            target: DeviceEventTarget::Interface { class, name },
        }
    }
}

/// Power broadcast (`PBT_*`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    QuerySuspend,
    QuerySuspendFailed,
    Suspend,
    ResumeCritical,
    ResumeSuspend,
    BatteryLow,
    PowerStatusChange,
    OemEvent,
    ResumeAutomatic,
    PowerSettingChange,
    Other(u32),
}

impl PowerEvent {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0x0000 => PowerEvent::QuerySuspend,
            0x0002 => PowerEvent::QuerySuspendFailed,
            0x0004 => PowerEvent::Suspend,
            0x0006 => PowerEvent::ResumeCritical,
            0x0007 => PowerEvent::ResumeSuspend,
            0x0009 => PowerEvent::BatteryLow,
            0x000A => PowerEvent::PowerStatusChange,
            0x000B => PowerEvent::OemEvent,
            0x0012 => PowerEvent::ResumeAutomatic,
            0x8013 => PowerEvent::PowerSettingChange,
            other => PowerEvent::Other(other),
        }
    }
}

/// Reason for a session change (`WTS_*`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionChangeReason {
    ConsoleConnect,
    ConsoleDisconnect,
    RemoteConnect,
    RemoteDisconnect,
    SessionLogon,
    SessionLogoff,
    SessionLock,
    SessionUnlock,
    SessionRemoteControl,
    SessionCreate,
    SessionTerminate,
    Other(u32),
}

impl SessionChangeReason {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => SessionChangeReason::ConsoleConnect,
            2 => SessionChangeReason::ConsoleDisconnect,
            3 => SessionChangeReason::RemoteConnect,
            4 => SessionChangeReason::RemoteDisconnect,
            5 => SessionChangeReason::SessionLogon,
            6 => SessionChangeReason::SessionLogoff,
            7 => SessionChangeReason::SessionLock,
            8 => SessionChangeReason::SessionUnlock,
            9 => SessionChangeReason::SessionRemoteControl,
            10 => SessionChangeReason::SessionCreate,
            11 => SessionChangeReason::SessionTerminate,
            other => SessionChangeReason::Other(other),
        }
    }
}

/// Session change payload, copied out of the OS buffer before the handler returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionChange {
    pub reason: SessionChangeReason,
    pub session_id: u32,
}
