//! In-process service manager
//!
//! Plays the role of the OS service manager inside the current process:
//! runs each dispatch entry on its own thread, delivers every control
//! request on one shared control-dispatch thread, records pushed status and
//! returns from `run_dispatcher` once every unit has reported Stopped.

use super::{
    ControlHandler, DeviceNotifier, DispatchEntry, NativeResult, NotificationFilter,
    NotificationHandle, ServiceManager, StatusHandle,
};
use crate::control::{ControlCode, ControlReply};
use crate::error::{NativeError, ERROR_SERVICE_NOT_ACTIVE};
use crate::status::{ServiceState, StatusRecord};
use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const ERROR_INVALID_HANDLE: u32 = 6;
const ERROR_INVALID_PARAMETER: u32 = 87;
const ERROR_SERVICE_DOES_NOT_EXIST: u32 = 1060;

type DispatchJob = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct UnitSlot {
    handler: Option<Arc<ControlHandler>>,
    history: Vec<StatusRecord>,
    finished: bool,
}

#[derive(Default)]
struct Shared {
    units: Mutex<HashMap<String, UnitSlot>>,
    changed: Condvar,
    dispatch_tx: Mutex<Option<Sender<DispatchJob>>>,
    start_args: Mutex<HashMap<String, Vec<String>>>,
    notifications: Mutex<HashMap<NotificationHandle, (String, NotificationFilter)>>,
    next_notification: AtomicU64,
    fail_registration: Mutex<Option<u32>>,
    fail_dispatcher: Mutex<Option<u32>>,
    fail_entries: Mutex<HashSet<String>>,
}

impl Shared {
    fn mark_finished(&self, name: &str) {
        let mut units = self.units.lock();
        if let Some(slot) = units.get_mut(name) {
            slot.finished = true;
        }
        self.changed.notify_all();
    }
}

/// Service manager that hosts units inside the current process
#[derive(Clone, Default)]
pub struct LocalServiceManager {
    shared: Arc<Shared>,
}

impl LocalServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for sending controls and observing status
    pub fn controller(&self) -> LocalController {
        LocalController {
            shared: self.shared.clone(),
        }
    }

    /// Arguments passed to a unit's entry point on the next run
    pub fn set_start_args(&self, name: &str, args: Vec<String>) {
        self.shared
            .start_args
            .lock()
            .insert(name.to_string(), args);
    }
}

impl ServiceManager for LocalServiceManager {
    fn run_dispatcher(&self, entries: Vec<DispatchEntry>) -> NativeResult<()> {
        if let Some(code) = self.shared.fail_dispatcher.lock().take() {
            return Err(NativeError::new(code, "StartServiceCtrlDispatcher failed"));
        }
        if entries.is_empty() {
            return Err(NativeError::new(
                ERROR_INVALID_PARAMETER,
                "dispatch table is empty",
            ));
        }

        let names: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();
        {
            let mut units = self.shared.units.lock();
            for name in &names {
                units.insert(name.clone(), UnitSlot::default());
            }
        }

        let (dispatch_tx, dispatch_rx) = unbounded::<DispatchJob>();
        *self.shared.dispatch_tx.lock() = Some(dispatch_tx);
        let dispatch_thread = thread::Builder::new()
            .name("svc-control-dispatch".to_string())
            .spawn(move || {
                while let Ok(job) = dispatch_rx.recv() {
                    job();
                }
            })
            .map_err(|e| NativeError::new(ERROR_INVALID_HANDLE, e.to_string()))?;

        info!("Local dispatcher running {} service(s)", names.len());

        let mut mains = Vec::with_capacity(entries.len());
        for entry in entries {
            let args = self
                .shared
                .start_args
                .lock()
                .get(&entry.name)
                .cloned()
                .unwrap_or_default();
            let shared = self.shared.clone();
            let name = entry.name.clone();
            let refused = self.shared.fail_entries.lock().remove(&name);
            let spawned = if refused {
                Err(io::Error::new(io::ErrorKind::Other, "entry thread refused"))
            } else {
                thread::Builder::new()
                    .name(format!("svc-main-{}", entry.name))
                    .spawn(move || {
                        (entry.main)(args);
                        let registered = shared
                            .units
                            .lock()
                            .get(&entry.name)
                            .is_some_and(|slot| slot.handler.is_some());
                        if !registered {
                            warn!("Service '{}' returned without registering", entry.name);
                            shared.mark_finished(&entry.name);
                        }
                    })
            };
            match spawned {
                Ok(handle) => mains.push(handle),
                Err(e) => {
                    warn!("Failed to start entry thread for '{}': {}", name, e);
                    self.shared.mark_finished(&name);
                }
            }
        }

        {
            let mut units = self.shared.units.lock();
            while !names
                .iter()
                .all(|name| units.get(name).map_or(true, |slot| slot.finished))
            {
                self.shared.changed.wait(&mut units);
            }
        }

        self.shared.dispatch_tx.lock().take();
        for handle in mains {
            let _ = handle.join();
        }
        let _ = dispatch_thread.join();
        info!("Local dispatcher finished");
        Ok(())
    }

    fn register_control_handler(
        &self,
        name: &str,
        handler: ControlHandler,
    ) -> NativeResult<Arc<dyn StatusHandle>> {
        let mut units = self.shared.units.lock();
        let slot = units.get_mut(name).ok_or_else(|| {
            NativeError::new(
                ERROR_SERVICE_DOES_NOT_EXIST,
                format!("service '{}' is not in the dispatch table", name),
            )
        })?;
        slot.handler = Some(Arc::new(handler));
        debug!("Registered control handler for '{}'", name);
        Ok(Arc::new(LocalStatusHandle {
            name: name.to_string(),
            shared: self.shared.clone(),
        }))
    }
}

struct LocalStatusHandle {
    name: String,
    shared: Arc<Shared>,
}

impl StatusHandle for LocalStatusHandle {
    fn set_status(&self, status: &StatusRecord) -> NativeResult<()> {
        let mut units = self.shared.units.lock();
        let slot = units.get_mut(&self.name).ok_or_else(|| {
            NativeError::new(ERROR_INVALID_HANDLE, "status handle is no longer valid")
        })?;
        slot.history.push(*status);
        if status.current_state == ServiceState::Stopped {
            slot.finished = true;
        }
        self.shared.changed.notify_all();
        Ok(())
    }

    fn device_notifier(&self) -> Arc<dyn DeviceNotifier> {
        Arc::new(LocalNotifier {
            name: self.name.clone(),
            shared: self.shared.clone(),
        })
    }
}

struct LocalNotifier {
    name: String,
    shared: Arc<Shared>,
}

impl DeviceNotifier for LocalNotifier {
    fn register(&self, filter: NotificationFilter) -> NativeResult<NotificationHandle> {
        if let Some(code) = self.shared.fail_registration.lock().take() {
            return Err(NativeError::new(code, "RegisterDeviceNotification failed"));
        }
        let handle =
            NotificationHandle(self.shared.next_notification.fetch_add(1, Ordering::Relaxed) + 1);
        self.shared
            .notifications
            .lock()
            .insert(handle, (self.name.clone(), filter));
        Ok(handle)
    }

    fn unregister(&self, handle: NotificationHandle) -> NativeResult<()> {
        self.shared
            .notifications
            .lock()
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| NativeError::new(ERROR_INVALID_HANDLE, "unknown notification handle"))
    }
}

/// Sends controls to units hosted by a [`LocalServiceManager`]
#[derive(Clone)]
pub struct LocalController {
    shared: Arc<Shared>,
}

impl LocalController {
    /// Deliver a control on the dispatch thread and wait for the handler's reply
    pub fn send(&self, name: &str, code: ControlCode) -> NativeResult<ControlReply> {
        let not_active = || {
            NativeError::new(
                ERROR_SERVICE_NOT_ACTIVE,
                format!("service '{}' is not active", name),
            )
        };

        let handler = {
            let units = self.shared.units.lock();
            let slot = units.get(name).ok_or_else(not_active)?;
            if slot.finished {
                return Err(not_active());
            }
            slot.handler.clone().ok_or_else(not_active)?
        };
        let dispatch_tx = self.shared.dispatch_tx.lock().clone().ok_or_else(not_active)?;

        let (reply_tx, reply_rx) = bounded(1);
        let job: DispatchJob = Box::new(move || {
            let _ = reply_tx.send(handler(code));
        });
        dispatch_tx.send(job).map_err(|_| not_active())?;
        reply_rx.recv().map_err(|_| not_active())
    }

    /// Last status pushed by a unit
    pub fn status(&self, name: &str) -> Option<StatusRecord> {
        self.shared
            .units
            .lock()
            .get(name)
            .and_then(|slot| slot.history.last().copied())
    }

    /// Every status pushed by a unit during the current or last run
    pub fn records(&self, name: &str) -> Vec<StatusRecord> {
        self.shared
            .units
            .lock()
            .get(name)
            .map(|slot| slot.history.clone())
            .unwrap_or_default()
    }

    /// Sequence of reported states with consecutive repeats collapsed
    pub fn history(&self, name: &str) -> Vec<ServiceState> {
        let mut states: Vec<ServiceState> = self
            .records(name)
            .into_iter()
            .map(|record| record.current_state)
            .collect();
        states.dedup();
        states
    }

    /// Wait until the last pushed state of `name` is `state`
    pub fn wait_for_state(&self, name: &str, state: ServiceState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut units = self.shared.units.lock();
        loop {
            let current = units
                .get(name)
                .and_then(|slot| slot.history.last())
                .map(|record| record.current_state);
            if current == Some(state) {
                return true;
            }
            if self
                .shared
                .changed
                .wait_until(&mut units, deadline)
                .timed_out()
            {
                return false;
            }
        }
    }

    /// Send Stop to every unit that is still active
    pub fn stop_all(&self) {
        let names: Vec<String> = self
            .shared
            .units
            .lock()
            .iter()
            .filter(|(_, slot)| !slot.finished && slot.handler.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            if let Err(e) = self.send(&name, ControlCode::Stop) {
                debug!("Stop for '{}' not delivered: {}", name, e);
            }
        }
    }

    /// Make the next device notification registration fail with `code`
    pub fn fail_next_registration(&self, code: u32) {
        *self.shared.fail_registration.lock() = Some(code);
    }

    /// Make the next `run_dispatcher` call fail with `code`
    pub fn fail_dispatcher(&self, code: u32) {
        *self.shared.fail_dispatcher.lock() = Some(code);
    }

    /// Make the entry thread of `name` fail to start on the next run
    pub fn fail_entry_start(&self, name: &str) {
        self.shared.fail_entries.lock().insert(name.to_string());
    }

    /// Native device notification registrations currently held
    pub fn active_notifications(&self) -> usize {
        self.shared.notifications.lock().len()
    }
}
