//! Host run loop
//!
//! Initializes every unit, hands the dispatch table to the service manager
//! and blocks until the manager returns, which happens once every hosted
//! unit has reported Stopped.

use crate::config::HostConfig;
use crate::error::{HostError, Result};
use crate::eventlog::{default_event_log, write_best_effort, EventLog, Severity};
use crate::machine::{DeferredDispatcher, ServiceUnit};
use crate::manager::{DispatchEntry, ServiceManager};
use crate::status::ServiceKind;
use crate::worker::WorkerPool;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Event source used for entries that belong to the host rather than a unit
pub const HOST_EVENT_SOURCE: &str = "servicehost";

pub struct ServiceHost {
    config: HostConfig,
    manager: Arc<dyn ServiceManager>,
    event_log: Arc<dyn EventLog>,
}

impl ServiceHost {
    pub fn new(manager: Arc<dyn ServiceManager>) -> Self {
        Self::with_config(manager, HostConfig::default())
    }

    pub fn with_config(manager: Arc<dyn ServiceManager>, config: HostConfig) -> Self {
        Self {
            config,
            manager,
            event_log: default_event_log(),
        }
    }

    /// Event log for host-level entries such as a failed dispatcher call
    pub fn with_event_log(mut self, event_log: Arc<dyn EventLog>) -> Self {
        self.event_log = event_log;
        self
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Host a single unit in its own process
    pub fn run_one(&self, unit: &ServiceUnit) -> Result<()> {
        self.run(std::slice::from_ref(unit))
    }

    /// Host `units` until every one of them has stopped.
    ///
    /// Start failures captured on worker threads are returned here once the
    /// service manager hands control back. Every unit is disposed on return.
    pub fn run(&self, units: &[ServiceUnit]) -> Result<()> {
        validate(units)?;

        let kind = if units.len() == 1 {
            ServiceKind::OwnProcess
        } else {
            ServiceKind::ShareProcess
        };
        let pool = WorkerPool::new(
            self.config.worker_threads,
            self.config.queue_capacity,
            self.config.fault_policy,
        );
        let dispatcher = DeferredDispatcher::new(pool.clone());

        for unit in units {
            if let Err(e) = unit
                .inner()
                .initialize(kind, dispatcher.clone(), &self.config)
            {
                pool.shutdown();
                return Err(e);
            }
        }

        let entries: Vec<DispatchEntry> = units
            .iter()
            .map(|unit| {
                let inner = unit.inner().clone();
                let manager = self.manager.clone();
                DispatchEntry {
                    name: unit.name(),
                    main: Box::new(move |args: Vec<String>| {
                        inner.service_main(manager.as_ref(), args)
                    }),
                }
            })
            .collect();

        info!("Hosting {} service(s) as {:?}", units.len(), kind);
        let outcome = self.manager.run_dispatcher(entries);
        if let Err(e) = &outcome {
            error!("Service dispatcher failed: {}", e);
            write_best_effort(
                self.event_log.as_ref(),
                HOST_EVENT_SOURCE,
                &format!("Service dispatcher failed to start: {}", e),
                Severity::Error,
            );
        }

        // Let hooks that are still queued finish before the units go away
        pool.shutdown();

        let failures: Vec<_> = units
            .iter()
            .filter_map(|unit| unit.inner().take_start_failure())
            .collect();
        for unit in units {
            unit.inner().dispose();
        }
        debug!("Host run finished with {} start failure(s)", failures.len());

        if !failures.is_empty() {
            return Err(HostError::StartFailed(failures));
        }
        outcome.map_err(HostError::Dispatcher)
    }
}

fn validate(units: &[ServiceUnit]) -> Result<()> {
    if units.is_empty() {
        return Err(HostError::NoServices);
    }
    let mut seen = HashSet::with_capacity(units.len());
    for unit in units {
        let name = unit.name();
        if unit.is_disposed() {
            return Err(HostError::Disposed(name));
        }
        if name.is_empty() {
            return Err(HostError::InvalidName {
                name,
                reason: "a hosted service needs a name",
            });
        }
        if !seen.insert(name.to_lowercase()) {
            return Err(HostError::DuplicateName(name));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{
        ControlCode, ControlReply, DeviceEvent, DeviceEventKind, PowerEvent, SessionChange,
        SessionChangeReason,
    };
    use crate::device::{DeviceHandle, DeviceSource, DeviceToken, RawHandle};
    use crate::error::ERROR_EXCEPTION_IN_SERVICE;
    use crate::machine::ServiceContext;
    use crate::manager::LocalServiceManager;
    use crate::service::{DeviceNotification, Service};
    use crate::status::{AcceptedCommands, ServiceState};
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};
    use ServiceState::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct RecordingLog {
        entries: Mutex<Vec<(String, String, Severity)>>,
    }

    impl RecordingLog {
        fn has(&self, severity: Severity, needle: &str) -> bool {
            self.entries
                .lock()
                .iter()
                .any(|(_, message, s)| *s == severity && message.contains(needle))
        }
    }

    impl EventLog for RecordingLog {
        fn write_entry(&self, source: &str, message: &str, severity: Severity) -> Result<()> {
            self.entries
                .lock()
                .push((source.to_string(), message.to_string(), severity));
            Ok(())
        }
    }

    #[derive(Debug)]
    struct FakeHandle(RawHandle);

    impl DeviceHandle for FakeHandle {
        fn raw_value(&self) -> RawHandle {
            self.0
        }
    }

    #[derive(Default)]
    struct Script {
        fail_start: bool,
        fail_pause: bool,
        fail_continue: bool,
        panic_stop_once: AtomicBool,
        stop_during_start: bool,
        extra_time_ms: Option<u32>,
    }

    struct Probe {
        script: Script,
        calls: Sender<String>,
    }

    impl Probe {
        fn record(&self, call: String) {
            let thread = thread::current().name().unwrap_or("").to_string();
            let _ = self.calls.send(format!("{}@{}", call, thread));
        }
    }

    impl Service for Probe {
        fn on_start(&self, ctx: &ServiceContext, _args: &[String]) -> anyhow::Result<()> {
            self.record("start".into());
            if let Some(ms) = self.script.extra_time_ms {
                ctx.request_additional_time(ms)?;
            }
            if self.script.stop_during_start {
                ctx.stop()?;
            }
            if self.script.fail_start {
                anyhow::bail!("database unreachable");
            }
            Ok(())
        }

        fn on_stop(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
            self.record("stop".into());
            if self.script.panic_stop_once.swap(false, Ordering::SeqCst) {
                panic!("stop blew up");
            }
            Ok(())
        }

        fn on_pause(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
            self.record("pause".into());
            if self.script.fail_pause {
                anyhow::bail!("cannot pause now");
            }
            Ok(())
        }

        fn on_continue(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
            self.record("continue".into());
            if self.script.fail_continue {
                anyhow::bail!("cannot resume now");
            }
            Ok(())
        }

        fn on_shutdown(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
            self.record("shutdown".into());
            Ok(())
        }

        fn on_custom_command(&self, _ctx: &ServiceContext, code: u32) -> anyhow::Result<()> {
            self.record(format!("custom:{}", code));
            Ok(())
        }

        fn on_power_event(&self, _ctx: &ServiceContext, event: PowerEvent) -> anyhow::Result<bool> {
            self.record(format!("power:{:?}", event));
            Ok(true)
        }

        fn on_session_change(
            &self,
            _ctx: &ServiceContext,
            change: SessionChange,
        ) -> anyhow::Result<()> {
            self.record(format!("session:{}", change.session_id));
            Ok(())
        }

        fn on_device_notification(
            &self,
            _ctx: &ServiceContext,
            notification: DeviceNotification,
        ) -> anyhow::Result<()> {
            if let DeviceSource::Handle { handle, .. } = &notification.source {
                self.record(format!(
                    "device:{:?}:{:#x}",
                    notification.kind,
                    handle.raw_value()
                ));
            }
            Ok(())
        }

        fn on_device_query_remove(&self, _ctx: &ServiceContext, source: &DeviceSource) -> bool {
            self.record("query-remove".into());
            match source {
                DeviceSource::Handle { token, .. } => {
                    token.downcast_ref::<&str>() != Some(&"locked")
                }
                DeviceSource::Interface { .. } => true,
            }
        }
    }

    fn probe(name: &str, script: Script) -> (ServiceUnit, Receiver<String>, Arc<RecordingLog>) {
        let (calls, rx) = unbounded();
        let unit = ServiceUnit::new(name, Probe { script, calls }).unwrap();
        let log = Arc::new(RecordingLog::default());
        unit.set_event_log(log.clone()).unwrap();
        (unit, rx, log)
    }

    fn test_config() -> HostConfig {
        HostConfig {
            worker_threads: 2,
            default_wait_hint_ms: 5_000,
            ..HostConfig::default()
        }
    }

    fn spawn_host(
        manager: &LocalServiceManager,
        units: Vec<ServiceUnit>,
    ) -> JoinHandle<Result<()>> {
        let host = ServiceHost::with_config(Arc::new(manager.clone()), test_config());
        thread::spawn(move || host.run(&units))
    }

    fn wait_for_history(
        manager: &LocalServiceManager,
        name: &str,
        expected: &[ServiceState],
    ) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            if manager.controller().history(name).ends_with(expected) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn next_call(calls: &Receiver<String>, prefix: &str) -> String {
        loop {
            let call = calls.recv_timeout(TIMEOUT).unwrap();
            if call.starts_with(prefix) {
                return call;
            }
        }
    }

    #[test]
    fn test_stop_reports_stop_pending_then_stopped() {
        let manager = LocalServiceManager::new();
        let controller = manager.controller();
        let (unit, calls, log) = probe("alpha", Script::default());
        let runner = spawn_host(&manager, vec![unit.clone()]);

        assert!(controller.wait_for_state("alpha", Running, TIMEOUT));
        assert_eq!(
            controller.send("alpha", ControlCode::Stop).unwrap(),
            ControlReply::NoError
        );
        runner.join().unwrap().unwrap();

        assert_eq!(
            controller.history("alpha"),
            vec![StartPending, Running, StopPending, Stopped]
        );
        let last = controller.status("alpha").unwrap();
        assert_eq!(last.exit_code, 0);
        assert_eq!(last.kind, ServiceKind::OwnProcess);
        assert!(last.accepted.is_empty());
        assert!(next_call(&calls, "stop").contains("svc-worker"));
        assert!(log.has(Severity::Information, "Service started successfully."));
        assert!(log.has(Severity::Information, "Service stopped successfully."));
        assert!(unit.is_disposed());
    }

    #[test]
    fn test_pending_records_carry_wait_hint() {
        let manager = LocalServiceManager::new();
        let controller = manager.controller();
        let (unit, _calls, _log) = probe("alpha", Script::default());
        let runner = spawn_host(&manager, vec![unit]);

        assert!(controller.wait_for_state("alpha", Running, TIMEOUT));
        controller.stop_all();
        runner.join().unwrap().unwrap();

        for record in controller.records("alpha") {
            if record.current_state.is_pending() {
                assert_eq!(record.wait_hint_ms, 5_000);
            } else {
                assert_eq!(record.wait_hint_ms, 0);
                assert_eq!(record.checkpoint, 0);
            }
        }
    }

    #[test]
    fn test_failed_pause_returns_to_running() {
        let manager = LocalServiceManager::new();
        let controller = manager.controller();
        let script = Script {
            fail_pause: true,
            ..Script::default()
        };
        let (unit, calls, log) = probe("alpha", script);
        unit.set_accepted(AcceptedCommands::PAUSE_CONTINUE, true)
            .unwrap();
        let runner = spawn_host(&manager, vec![unit]);

        assert!(controller.wait_for_state("alpha", Running, TIMEOUT));
        assert_eq!(
            controller.send("alpha", ControlCode::Pause).unwrap(),
            ControlReply::NoError
        );
        assert!(wait_for_history(&manager, "alpha", &[PausePending, Running]));
        next_call(&calls, "pause");
        assert!(log.has(Severity::Error, "on_pause failed: cannot pause now"));

        controller.stop_all();
        runner.join().unwrap().unwrap();
    }

    /// Start a unit accepting pause/continue and bring it to Paused
    fn spawn_paused(
        manager: &LocalServiceManager,
        script: Script,
        extra: AcceptedCommands,
    ) -> (JoinHandle<Result<()>>, Receiver<String>, Arc<RecordingLog>) {
        let (unit, calls, log) = probe("alpha", script);
        unit.set_accepted(AcceptedCommands::PAUSE_CONTINUE | extra, true)
            .unwrap();
        let runner = spawn_host(manager, vec![unit]);
        let controller = manager.controller();
        assert!(controller.wait_for_state("alpha", Running, TIMEOUT));
        controller.send("alpha", ControlCode::Pause).unwrap();
        assert!(wait_for_history(manager, "alpha", &[PausePending, Paused]));
        (runner, calls, log)
    }

    #[test]
    fn test_pause_then_continue_returns_to_running() {
        let manager = LocalServiceManager::new();
        let controller = manager.controller();
        let (runner, calls, log) =
            spawn_paused(&manager, Script::default(), AcceptedCommands::empty());

        assert_eq!(
            controller.send("alpha", ControlCode::Continue).unwrap(),
            ControlReply::NoError
        );
        assert!(wait_for_history(
            &manager,
            "alpha",
            &[PausePending, Paused, ContinuePending, Running]
        ));
        assert!(next_call(&calls, "continue").contains("svc-worker"));
        assert!(log.has(Severity::Information, "Service paused successfully."));
        assert!(log.has(Severity::Information, "Service continued successfully."));

        controller.stop_all();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_failed_continue_returns_to_paused() {
        let manager = LocalServiceManager::new();
        let controller = manager.controller();
        let script = Script {
            fail_continue: true,
            ..Script::default()
        };
        let (runner, calls, log) = spawn_paused(&manager, script, AcceptedCommands::empty());

        controller.send("alpha", ControlCode::Continue).unwrap();
        assert!(wait_for_history(&manager, "alpha", &[ContinuePending, Paused]));
        next_call(&calls, "continue");
        assert!(log.has(Severity::Error, "on_continue failed: cannot resume now"));
        assert_eq!(controller.status("alpha").unwrap().current_state, Paused);

        // Stop is legal from Paused
        controller.send("alpha", ControlCode::Stop).unwrap();
        runner.join().unwrap().unwrap();
        assert!(controller.history("alpha").ends_with(&[Paused, StopPending, Stopped]));
    }

    #[test]
    fn test_shutdown_while_paused_goes_straight_to_stopped() {
        let manager = LocalServiceManager::new();
        let controller = manager.controller();
        let (runner, calls, _) =
            spawn_paused(&manager, Script::default(), AcceptedCommands::SHUTDOWN);

        controller.send("alpha", ControlCode::Shutdown).unwrap();
        runner.join().unwrap().unwrap();

        let history = controller.history("alpha");
        assert!(history.ends_with(&[Paused, Stopped]), "{:?}", history);
        assert!(!history.contains(&StopPending));
        let seen: Vec<String> = calls.try_iter().collect();
        assert!(seen.iter().any(|c| c.starts_with("shutdown")));
        assert!(!seen.iter().any(|c| c.starts_with("stop")));
    }

    #[test]
    fn test_interrogate_reports_without_changing_state() {
        let manager = LocalServiceManager::new();
        let controller = manager.controller();
        let (unit, _calls, _) = probe("alpha", Script::default());
        let runner = spawn_host(&manager, vec![unit]);
        assert!(controller.wait_for_state("alpha", Running, TIMEOUT));

        let before = controller.records("alpha");
        assert_eq!(
            controller.send("alpha", ControlCode::Interrogate).unwrap(),
            ControlReply::NoError
        );
        let after = controller.records("alpha");
        assert_eq!(after.len(), before.len() + 1);
        assert_eq!(after.last(), before.last());
        assert_eq!(after.last().unwrap().current_state, Running);
        assert_eq!(controller.history("alpha"), vec![StartPending, Running]);

        controller.stop_all();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_failed_stop_restores_previous_state() {
        let manager = LocalServiceManager::new();
        let controller = manager.controller();
        let script = Script {
            panic_stop_once: AtomicBool::new(true),
            ..Script::default()
        };
        let (unit, _calls, log) = probe("alpha", script);
        let runner = spawn_host(&manager, vec![unit]);

        assert!(controller.wait_for_state("alpha", Running, TIMEOUT));
        controller.send("alpha", ControlCode::Stop).unwrap();
        assert!(wait_for_history(&manager, "alpha", &[StopPending, Running]));
        assert!(log.has(Severity::Error, "panicked: stop blew up"));

        controller.send("alpha", ControlCode::Stop).unwrap();
        runner.join().unwrap().unwrap();
        assert!(controller.history("alpha").ends_with(&[StopPending, Stopped]));
    }

    #[test]
    fn test_stopping_one_unit_leaves_the_other_running() {
        let manager = LocalServiceManager::new();
        let controller = manager.controller();
        let (a, _a_calls, _) = probe("a", Script::default());
        let (b, _b_calls, _) = probe("b", Script::default());
        let runner = spawn_host(&manager, vec![a, b]);

        assert!(controller.wait_for_state("a", Running, TIMEOUT));
        assert!(controller.wait_for_state("b", Running, TIMEOUT));
        controller.send("a", ControlCode::Stop).unwrap();
        assert!(controller.wait_for_state("a", Stopped, TIMEOUT));

        let b_status = controller.status("b").unwrap();
        assert_eq!(b_status.current_state, Running);
        assert_eq!(b_status.kind, ServiceKind::ShareProcess);
        assert!(!runner.is_finished());

        controller.send("b", ControlCode::Stop).unwrap();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_device_event_for_unknown_handle_is_dropped() {
        let manager = LocalServiceManager::new();
        let controller = manager.controller();
        let (unit, calls, _) = probe("alpha", Script::default());
        let runner = spawn_host(&manager, vec![unit.clone()]);
        assert!(controller.wait_for_state("alpha", Running, TIMEOUT));

        let subscription = unit
            .context()
            .register_device_notifications(Arc::new(FakeHandle(0x10)), DeviceToken::new("disk"))
            .unwrap();
        assert_eq!(controller.active_notifications(), 1);

        let stray = DeviceEvent::for_handle(DeviceEventKind::RemoveComplete, 0x20);
        assert_eq!(
            controller
                .send("alpha", ControlCode::DeviceEvent(stray))
                .unwrap(),
            ControlReply::NoError
        );
        let arrival = DeviceEvent::for_handle(DeviceEventKind::Arrival, 0x10);
        controller
            .send("alpha", ControlCode::DeviceEvent(arrival))
            .unwrap();

        let call = next_call(&calls, "device:");
        assert!(call.starts_with("device:Arrival:0x10"), "{}", call);
        thread::sleep(Duration::from_millis(50));
        assert!(calls.try_iter().all(|c| !c.starts_with("device:")));

        subscription.dispose();
        assert_eq!(controller.active_notifications(), 0);
        controller.stop_all();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_query_remove_is_answered_on_dispatch_thread() {
        let manager = LocalServiceManager::new();
        let controller = manager.controller();
        let (unit, calls, _) = probe("alpha", Script::default());
        let runner = spawn_host(&manager, vec![unit.clone()]);
        assert!(controller.wait_for_state("alpha", Running, TIMEOUT));

        let ctx = unit.context();
        let _locked = ctx
            .register_device_notifications(Arc::new(FakeHandle(0x10)), DeviceToken::new("locked"))
            .unwrap();
        let _free = ctx
            .register_device_notifications(Arc::new(FakeHandle(0x11)), DeviceToken::new("free"))
            .unwrap();

        let query = |raw| {
            ControlCode::DeviceEvent(DeviceEvent::for_handle(DeviceEventKind::QueryRemove, raw))
        };
        assert_eq!(controller.send("alpha", query(0x10)).unwrap(), ControlReply::Deny);
        assert_eq!(
            next_call(&calls, "query-remove"),
            "query-remove@svc-control-dispatch"
        );
        assert_eq!(
            controller.send("alpha", query(0x11)).unwrap(),
            ControlReply::NoError
        );
        assert_eq!(
            controller.send("alpha", query(0x99)).unwrap(),
            ControlReply::NoError
        );
        assert_eq!(ControlReply::Deny.code(), crate::control::BROADCAST_QUERY_DENY);

        controller.stop_all();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_request_additional_time_only_while_pending() {
        let manager = LocalServiceManager::new();
        let controller = manager.controller();
        let script = Script {
            extra_time_ms: Some(2_000),
            ..Script::default()
        };
        let (unit, _calls, _) = probe("alpha", script);
        let runner = spawn_host(&manager, vec![unit.clone()]);
        assert!(controller.wait_for_state("alpha", Running, TIMEOUT));

        let extended = controller
            .records("alpha")
            .into_iter()
            .find(|record| record.checkpoint == 1)
            .unwrap();
        assert_eq!(extended.current_state, StartPending);
        assert_eq!(extended.wait_hint_ms, 2_000);

        let err = unit.context().request_additional_time(1_000).unwrap_err();
        assert!(matches!(err, HostError::InvalidOperation(_)));

        controller.stop_all();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_start_failure_surfaces_from_run() {
        let manager = LocalServiceManager::new();
        let controller = manager.controller();
        let script = Script {
            fail_start: true,
            ..Script::default()
        };
        let (unit, _calls, log) = probe("alpha", script);
        let runner = spawn_host(&manager, vec![unit]);

        match runner.join().unwrap() {
            Err(HostError::StartFailed(failures)) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].service, "alpha");
                assert!(failures[0].message.contains("database unreachable"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(controller.history("alpha"), vec![StartPending, Stopped]);
        assert_eq!(
            controller.status("alpha").unwrap().exit_code,
            ERROR_EXCEPTION_IN_SERVICE
        );
        assert!(log.has(Severity::Error, "on_start failed"));
    }

    #[test]
    fn test_stop_requested_during_start_runs_after_start() {
        let manager = LocalServiceManager::new();
        let controller = manager.controller();
        let script = Script {
            stop_during_start: true,
            ..Script::default()
        };
        let (unit, calls, _) = probe("alpha", script);
        let runner = spawn_host(&manager, vec![unit]);

        runner.join().unwrap().unwrap();
        assert_eq!(
            controller.history("alpha"),
            vec![StartPending, Running, StopPending, Stopped]
        );
        next_call(&calls, "stop");
    }

    #[test]
    fn test_shutdown_skips_stop_pending() {
        let manager = LocalServiceManager::new();
        let controller = manager.controller();
        let (unit, calls, log) = probe("alpha", Script::default());
        unit.set_accepted(AcceptedCommands::SHUTDOWN, true).unwrap();
        let runner = spawn_host(&manager, vec![unit]);

        assert!(controller.wait_for_state("alpha", Running, TIMEOUT));
        controller.send("alpha", ControlCode::Shutdown).unwrap();
        runner.join().unwrap().unwrap();

        assert_eq!(controller.history("alpha"), vec![StartPending, Running, Stopped]);
        let seen: Vec<String> = calls.try_iter().collect();
        assert!(seen.iter().any(|c| c.starts_with("shutdown")));
        assert!(!seen.iter().any(|c| c.starts_with("stop")));
        assert!(log.has(Severity::Information, "Service shutdown successfully."));
    }

    #[test]
    fn test_custom_power_and_session_are_deferred() {
        let manager = LocalServiceManager::new();
        let controller = manager.controller();
        let (unit, calls, _) = probe("alpha", Script::default());
        unit.set_accepted(AcceptedCommands::POWER_EVENT, true)
            .unwrap();
        let runner = spawn_host(&manager, vec![unit]);
        assert!(controller.wait_for_state("alpha", Running, TIMEOUT));

        controller.send("alpha", ControlCode::Custom(200)).unwrap();
        assert!(next_call(&calls, "custom:200").contains("svc-worker"));

        controller
            .send("alpha", ControlCode::PowerEvent(PowerEvent::Suspend))
            .unwrap();
        assert!(next_call(&calls, "power:Suspend").contains("svc-worker"));

        let change = SessionChange {
            reason: SessionChangeReason::SessionLogon,
            session_id: 2,
        };
        assert_eq!(
            controller
                .send("alpha", ControlCode::SessionChange(change))
                .unwrap(),
            ControlReply::NotImplemented
        );

        controller.stop_all();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_registration_failure_unwinds_table_entry() {
        let manager = LocalServiceManager::new();
        let controller = manager.controller();
        let (unit, _calls, _) = probe("alpha", Script::default());
        let runner = spawn_host(&manager, vec![unit.clone()]);
        assert!(controller.wait_for_state("alpha", Running, TIMEOUT));

        let handle: Arc<dyn DeviceHandle> = Arc::new(FakeHandle(0x30));
        controller.fail_next_registration(1066);
        let err = unit
            .context()
            .register_device_notifications(handle.clone(), DeviceToken::new(()))
            .unwrap_err();
        assert_eq!(err.native_code(), Some(1066));
        assert_eq!(controller.active_notifications(), 0);
        assert_eq!(Arc::strong_count(&handle), 1);

        let subscription = unit
            .context()
            .register_device_notifications(handle.clone(), DeviceToken::new(()))
            .unwrap();
        assert_eq!(controller.active_notifications(), 1);
        drop(subscription);
        assert_eq!(controller.active_notifications(), 0);

        controller.stop_all();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_run_rejects_bad_unit_sets() {
        let host = ServiceHost::new(Arc::new(LocalServiceManager::new()));
        assert!(matches!(host.run(&[]), Err(HostError::NoServices)));

        let (a, _, _) = probe("twin", Script::default());
        let (b, _, _) = probe("TWIN", Script::default());
        assert!(matches!(
            host.run(&[a.clone(), b]),
            Err(HostError::DuplicateName(_))
        ));
        // Validation happens before anything is frozen
        a.set_name("renamed").unwrap();

        let (unnamed, _, _) = probe("", Script::default());
        assert!(matches!(
            host.run_one(&unnamed),
            Err(HostError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_disposed_unit_cannot_run_again() {
        let manager = LocalServiceManager::new();
        let controller = manager.controller();
        let (unit, _calls, _) = probe("alpha", Script::default());
        let runner = spawn_host(&manager, vec![unit.clone()]);
        assert!(controller.wait_for_state("alpha", Running, TIMEOUT));
        controller.stop_all();
        runner.join().unwrap().unwrap();

        assert!(matches!(unit.set_name("beta"), Err(HostError::Frozen(_))));
        let host = ServiceHost::new(Arc::new(manager));
        assert!(matches!(host.run_one(&unit), Err(HostError::Disposed(_))));
    }

    #[test]
    fn test_dispatcher_failure_is_logged_and_returned() {
        let manager = LocalServiceManager::new();
        manager.controller().fail_dispatcher(1063);
        let log = Arc::new(RecordingLog::default());
        let host = ServiceHost::with_config(Arc::new(manager), test_config())
            .with_event_log(log.clone());
        let (unit, _calls, _) = probe("alpha", Script::default());

        match host.run_one(&unit) {
            Err(HostError::Dispatcher(e)) => assert_eq!(e.code, 1063),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(log.has(Severity::Error, "Service dispatcher failed to start"));
        assert!(unit.is_disposed());
    }
}
