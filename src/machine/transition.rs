//! Transition table: (state, accepted commands, control) -> plan

use crate::control::{ControlCode, DeviceEvent, DeviceEventKind, PowerEvent, SessionChange};
use crate::service::DeviceNotification;
use crate::status::{AcceptedCommands, ServiceState};

/// A lifecycle hook to invoke on a worker thread
#[derive(Debug, Clone)]
pub(crate) enum Hook {
    Start(Vec<String>),
    Stop,
    Pause,
    Continue,
    Shutdown,
    Custom(u32),
    Power(PowerEvent),
    Session(SessionChange),
    Device(DeviceNotification),
}

impl Hook {
    pub fn label(&self) -> &'static str {
        match self {
            Hook::Start(_) => "on_start",
            Hook::Stop => "on_stop",
            Hook::Pause => "on_pause",
            Hook::Continue => "on_continue",
            Hook::Shutdown => "on_shutdown",
            Hook::Custom(_) => "on_custom_command",
            Hook::Power(_) => "on_power_event",
            Hook::Session(_) => "on_session_change",
            Hook::Device(_) => "on_device_notification",
        }
    }

    /// Entry written on success when auto-logging is enabled
    pub fn success_message(&self) -> Option<&'static str> {
        match self {
            Hook::Start(_) => Some("Service started successfully."),
            Hook::Stop => Some("Service stopped successfully."),
            Hook::Pause => Some("Service paused successfully."),
            Hook::Continue => Some("Service continued successfully."),
            Hook::Shutdown => Some("Service shutdown successfully."),
            _ => None,
        }
    }
}

/// A pending transition announced on the dispatch thread and settled by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingTransition {
    pub from: ServiceState,
    pub pending: ServiceState,
    pub success: ServiceState,
    pub failure: ServiceState,
}

impl PendingTransition {
    /// Stop from Running or Paused; failure restores where it came from
    pub fn stop_from(from: ServiceState) -> Option<Self> {
        matches!(from, ServiceState::Running | ServiceState::Paused).then_some(Self {
            from,
            pending: ServiceState::StopPending,
            success: ServiceState::Stopped,
            failure: from,
        })
    }
}

/// What the dispatch thread does with a control request
#[derive(Debug, Clone)]
pub(crate) enum Plan {
    /// Push the current status, no state change
    Report,
    /// Announce the pending state, then run the hook on a worker
    Transition(PendingTransition, Hook),
    /// Run the shutdown hook on a worker, then move to Stopped
    Shutdown,
    /// Run the hook on a worker without touching the state
    Defer(Hook),
    /// Answer on the dispatch thread before returning
    QueryRemove(DeviceEvent),
    /// Route through the device tables, then defer
    DeviceNotify(DeviceEvent),
    /// Illegal in the current state; a no-op
    Ignore,
    /// The unit does not accept this command
    NotAccepted,
}

pub(crate) fn plan(state: ServiceState, accepted: AcceptedCommands, code: ControlCode) -> Plan {
    match code {
        ControlCode::Interrogate => Plan::Report,
        ControlCode::Stop => {
            if !accepted.contains(AcceptedCommands::STOP) {
                return Plan::NotAccepted;
            }
            match PendingTransition::stop_from(state) {
                Some(t) => Plan::Transition(t, Hook::Stop),
                None => Plan::Ignore,
            }
        }
        ControlCode::Pause => {
            if !accepted.contains(AcceptedCommands::PAUSE_CONTINUE) {
                return Plan::NotAccepted;
            }
            if state != ServiceState::Running {
                return Plan::Ignore;
            }
            Plan::Transition(
                PendingTransition {
                    from: ServiceState::Running,
                    pending: ServiceState::PausePending,
                    success: ServiceState::Paused,
                    failure: ServiceState::Running,
                },
                Hook::Pause,
            )
        }
        ControlCode::Continue => {
            if !accepted.contains(AcceptedCommands::PAUSE_CONTINUE) {
                return Plan::NotAccepted;
            }
            if state != ServiceState::Paused {
                return Plan::Ignore;
            }
            Plan::Transition(
                PendingTransition {
                    from: ServiceState::Paused,
                    pending: ServiceState::ContinuePending,
                    success: ServiceState::Running,
                    failure: ServiceState::Paused,
                },
                Hook::Continue,
            )
        }
        ControlCode::Shutdown => {
            if !accepted.contains(AcceptedCommands::SHUTDOWN) {
                return Plan::NotAccepted;
            }
            match state {
                ServiceState::Running | ServiceState::Paused => Plan::Shutdown,
                _ => Plan::Ignore,
            }
        }
        ControlCode::Custom(code) => {
            if state.is_pending() {
                Plan::Ignore
            } else {
                Plan::Defer(Hook::Custom(code))
            }
        }
        ControlCode::DeviceEvent(event) => {
            if event.kind == DeviceEventKind::QueryRemove {
                Plan::QueryRemove(event)
            } else {
                Plan::DeviceNotify(event)
            }
        }
        ControlCode::PowerEvent(event) => {
            if accepted.contains(AcceptedCommands::POWER_EVENT) {
                Plan::Defer(Hook::Power(event))
            } else {
                Plan::NotAccepted
            }
        }
        ControlCode::SessionChange(change) => {
            if accepted.contains(AcceptedCommands::SESSION_CHANGE) {
                Plan::Defer(Hook::Session(change))
            } else {
                Plan::NotAccepted
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::SessionChangeReason;
    use ServiceState::*;

    const ALL: AcceptedCommands = AcceptedCommands::from_bits_truncate(0xFF);

    /// Walk a control sequence through the table, settling every transition
    fn walk(codes: &[ControlCode]) -> Vec<ServiceState> {
        let mut state = Running;
        let mut seen = vec![state];
        for code in codes {
            match plan(state, ALL, code.clone()) {
                Plan::Transition(t, _) => {
                    assert_eq!(t.from, state);
                    seen.push(t.pending);
                    state = t.success;
                    seen.push(state);
                }
                Plan::Shutdown => {
                    state = Stopped;
                    seen.push(state);
                }
                _ => {}
            }
        }
        seen
    }

    #[test]
    fn test_pause_continue_stop_sequence() {
        let seen = walk(&[ControlCode::Pause, ControlCode::Continue, ControlCode::Stop]);
        assert_eq!(
            seen,
            vec![
                Running,
                PausePending,
                Paused,
                ContinuePending,
                Running,
                StopPending,
                Stopped
            ]
        );
    }

    #[test]
    fn test_illegal_sequences_are_noops() {
        assert_eq!(walk(&[ControlCode::Continue]), vec![Running]);
        assert_eq!(
            walk(&[ControlCode::Pause, ControlCode::Pause]),
            vec![Running, PausePending, Paused]
        );
        assert_eq!(
            walk(&[ControlCode::Stop, ControlCode::Stop, ControlCode::Pause]),
            vec![Running, StopPending, Stopped]
        );
    }

    #[test]
    fn test_pending_states_ignore_lifecycle_controls() {
        for pending in [StartPending, PausePending, ContinuePending, StopPending] {
            for code in [
                ControlCode::Stop,
                ControlCode::Pause,
                ControlCode::Continue,
                ControlCode::Shutdown,
                ControlCode::Custom(200),
            ] {
                assert!(
                    matches!(plan(pending, ALL, code.clone()), Plan::Ignore),
                    "{:?} in {} was not ignored",
                    code,
                    pending
                );
            }
        }
    }

    #[test]
    fn test_stop_from_paused_rolls_back_to_paused() {
        match plan(Paused, ALL, ControlCode::Stop) {
            Plan::Transition(t, Hook::Stop) => {
                assert_eq!(t.pending, StopPending);
                assert_eq!(t.failure, Paused);
            }
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_continue_rolls_back_to_paused() {
        match plan(Paused, ALL, ControlCode::Continue) {
            Plan::Transition(t, Hook::Continue) => {
                assert_eq!(t.pending, ContinuePending);
                assert_eq!(t.success, Running);
                assert_eq!(t.failure, Paused);
            }
            other => panic!("unexpected plan {:?}", other),
        }
        assert!(matches!(plan(Running, ALL, ControlCode::Continue), Plan::Ignore));
    }

    #[test]
    fn test_shutdown_skips_stop_pending() {
        assert!(matches!(plan(Paused, ALL, ControlCode::Shutdown), Plan::Shutdown));
        assert!(matches!(plan(Stopped, ALL, ControlCode::Shutdown), Plan::Ignore));
    }

    #[test]
    fn test_unaccepted_commands() {
        let stop_only = AcceptedCommands::STOP;
        assert!(matches!(
            plan(Running, stop_only, ControlCode::Pause),
            Plan::NotAccepted
        ));
        assert!(matches!(
            plan(Running, stop_only, ControlCode::Shutdown),
            Plan::NotAccepted
        ));
        assert!(matches!(
            plan(Running, AcceptedCommands::empty(), ControlCode::Stop),
            Plan::NotAccepted
        ));
        let change = SessionChange {
            reason: SessionChangeReason::SessionLock,
            session_id: 3,
        };
        assert!(matches!(
            plan(Running, stop_only, ControlCode::SessionChange(change)),
            Plan::NotAccepted
        ));
        assert!(matches!(
            plan(Running, ALL, ControlCode::SessionChange(change)),
            Plan::Defer(Hook::Session(c)) if c.session_id == 3
        ));
    }

    #[test]
    fn test_interrogate_and_device_events_in_any_state() {
        for state in [StartPending, Running, Paused, StopPending, Stopped] {
            assert!(matches!(plan(state, ALL, ControlCode::Interrogate), Plan::Report));
            let query = DeviceEvent::for_handle(DeviceEventKind::QueryRemove, 1);
            assert!(matches!(
                plan(state, AcceptedCommands::empty(), ControlCode::DeviceEvent(query)),
                Plan::QueryRemove(_)
            ));
            let arrival = DeviceEvent::for_handle(DeviceEventKind::Arrival, 1);
            assert!(matches!(
                plan(state, AcceptedCommands::empty(), ControlCode::DeviceEvent(arrival)),
                Plan::DeviceNotify(_)
            ));
        }
    }
}
