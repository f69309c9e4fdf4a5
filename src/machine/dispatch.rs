//! Deferred dispatch: hands hooks to the worker pool and sequences the
//! status updates around them.
//!
//! The dispatch thread only ever announces a pending state; the worker that
//! runs the hook settles it. The claim in `StatusCell::begin_pending` makes
//! that worker the single writer until it settles.

use super::transition::{Hook, PendingTransition};
use super::UnitInner;
use crate::control::ControlReply;
use crate::error::Result;
use crate::status::ServiceState;
use crate::worker::WorkerPool;
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Clone)]
pub(crate) struct DeferredDispatcher {
    pool: WorkerPool,
}

impl DeferredDispatcher {
    pub fn new(pool: WorkerPool) -> Self {
        Self { pool }
    }

    fn submit<F>(&self, unit: &UnitInner, label: &'static str, job: F) -> bool
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        match self.pool.submit(job) {
            Ok(()) => true,
            Err(e) => {
                error!(
                    service = %unit.name(),
                    hook = label,
                    "Failed to defer callback: {}",
                    e
                );
                false
            }
        }
    }

    /// Run the start hook on a worker; the unit is already StartPending
    pub fn begin_start(&self, unit: &Arc<UnitInner>, args: Vec<String>) {
        let worker_unit = unit.clone();
        let hook = Hook::Start(args);
        if !self.submit(unit, hook.label(), move || worker_unit.complete_start(hook)) {
            unit.fail_start_without_worker();
        }
    }

    /// Announce the pending state now and settle it once the hook returns
    pub fn begin_transition(
        &self,
        unit: &Arc<UnitInner>,
        transition: PendingTransition,
        hook: Hook,
    ) -> ControlReply {
        if !unit
            .status
            .begin_pending(transition.from, transition.pending, unit.wait_hint_ms())
        {
            debug!(
                service = %unit.name(),
                "Ignoring {}: state changed to {}",
                hook.label(),
                unit.status.state()
            );
            return ControlReply::NoError;
        }
        unit.push_status_logged();

        let worker_unit = unit.clone();
        let label = hook.label();
        let queued = self.submit(unit, label, move || {
            worker_unit.complete_transition(transition, hook)
        });
        if !queued {
            unit.status.settle(transition.from);
            unit.push_status_logged();
        }
        ControlReply::NoError
    }

    /// Run the shutdown hook without announcing a pending state
    pub fn begin_shutdown(&self, unit: &Arc<UnitInner>) -> ControlReply {
        let worker_unit = unit.clone();
        self.submit(unit, Hook::Shutdown.label(), move || {
            let result = worker_unit.invoke(&Hook::Shutdown);
            let moved = [ServiceState::Running, ServiceState::Paused]
                .into_iter()
                .any(|from| worker_unit.status.try_settle(from, ServiceState::Stopped));
            worker_unit.finish_hook(&Hook::Shutdown, result, || {
                if moved {
                    worker_unit.push_status_logged();
                }
            })
        });
        ControlReply::NoError
    }

    /// Run a hook that does not change the lifecycle state
    pub fn defer(&self, unit: &Arc<UnitInner>, hook: Hook) -> ControlReply {
        let worker_unit = unit.clone();
        let label = hook.label();
        self.submit(unit, label, move || {
            let result = worker_unit.invoke(&hook);
            worker_unit.finish_hook(&hook, result, || {})
        });
        ControlReply::NoError
    }
}
