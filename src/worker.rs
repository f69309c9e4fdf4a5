//! Worker pool executing deferred service callbacks

use crate::config::FaultPolicy;
use crate::error::{HostError, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// A unit of deferred work. An `Err` is an unhandled service fault.
pub type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

struct PoolInner {
    sender: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    fault_policy: FaultPolicy,
    overflow_spawned: AtomicUsize,
    faults: AtomicUsize,
}

/// Fixed set of worker threads fed by a bounded queue
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(threads: usize, capacity: usize, fault_policy: FaultPolicy) -> Self {
        let threads = threads.max(1);
        let (sender, receiver) = bounded::<Job>(capacity.max(1));
        let inner = Arc::new(PoolInner {
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(Vec::with_capacity(threads)),
            fault_policy,
            overflow_spawned: AtomicUsize::new(0),
            faults: AtomicUsize::new(0),
        });

        for index in 0..threads {
            let receiver = receiver.clone();
            let pool = Arc::downgrade(&inner);
            let spawned = thread::Builder::new()
                .name(format!("svc-worker-{}", index))
                .spawn(move || {
                    Self::worker_loop(receiver, pool);
                });
            match spawned {
                Ok(handle) => inner.handles.lock().push(handle),
                Err(e) => error!("Failed to spawn worker thread {}: {}", index, e),
            }
        }

        debug!("Worker pool started with {} threads", threads);
        Self { inner }
    }

    fn worker_loop(receiver: Receiver<Job>, pool: std::sync::Weak<PoolInner>) {
        while let Ok(job) = receiver.recv() {
            let result = job();
            if let Some(pool) = pool.upgrade() {
                pool.handle_result(result);
            } else if let Err(e) = result {
                error!(kind = e.as_label(), "Unhandled service fault: {}", e);
            }
        }
    }

    /// Queue a job without blocking the caller.
    ///
    /// When the queue is full the job runs on a dedicated overflow thread.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let sender = self
            .inner
            .sender
            .lock()
            .clone()
            .ok_or(HostError::WorkerPoolClosed)?;

        match sender.try_send(Box::new(job)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                warn!("Worker queue full, running deferred callback on an overflow thread");
                self.inner.overflow_spawned.fetch_add(1, Ordering::Relaxed);
                let inner = self.inner.clone();
                let handle = thread::Builder::new()
                    .name("svc-worker-overflow".to_string())
                    .spawn(move || inner.handle_result(job()))
                    .map_err(|e| {
                        error!("Failed to spawn overflow worker: {}", e);
                        HostError::WorkerPoolClosed
                    })?;
                // Joined by shutdown like the fixed workers
                let mut handles = self.inner.handles.lock();
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(HostError::WorkerPoolClosed),
        }
    }

    /// Number of jobs that ended in an unhandled fault
    pub fn fault_count(&self) -> usize {
        self.inner.faults.load(Ordering::Relaxed)
    }

    /// Number of jobs that did not fit in the queue
    pub fn overflow_count(&self) -> usize {
        self.inner.overflow_spawned.load(Ordering::Relaxed)
    }

    /// Stop accepting work, drain the queue and join the workers,
    /// overflow threads included
    pub fn shutdown(&self) {
        self.inner.sender.lock().take();
        let current = thread::current().id();
        loop {
            // A submit that cloned the sender before it was taken may still add an overflow thread
            let handles: Vec<_> = self.inner.handles.lock().drain(..).collect();
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                // A worker cannot join itself
                if handle.thread().id() == current {
                    continue;
                }
                if handle.join().is_err() {
                    warn!("Worker thread panicked during shutdown");
                }
            }
        }
    }
}

impl PoolInner {
    fn handle_result(&self, result: Result<()>) {
        let Err(e) = result else {
            return;
        };
        self.faults.fetch_add(1, Ordering::Relaxed);
        error!(kind = e.as_label(), "Unhandled service fault: {}", e);
        if self.fault_policy == FaultPolicy::Abort {
            std::process::abort();
        }
    }
}
