//! Event dispatcher shared by every stream handle of a factory.
//!
//! The dispatcher decouples reading frames from running listener code: the
//! supervisor submits one task per frame and returns to the socket while a
//! small fixed pool of worker threads invokes the callbacks.
//!
//! Each worker owns its own queue and a session is pinned to one worker, so
//! tasks of one session run in submission order while different sessions
//! may run in parallel. Workers are named threads owned by the dispatcher,
//! independent of any tokio runtime.

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::stream::listener::panic_message;

/// Unit of listener work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher is shut down")]
    ShutDown,

    #[error("failed to start dispatcher worker: {0}")]
    Spawn(#[from] io::Error),
}

/// Fixed-size pool of worker threads fed by per-worker queues.
#[derive(Debug)]
pub struct Dispatcher {
    lanes: Mutex<Option<Vec<mpsc::UnboundedSender<Task>>>>,
    workers: usize,
}

impl Dispatcher {
    /// Starts `workers` threads named `{name}-dispatcher-{index}`.
    pub fn new(workers: usize, name: &str) -> Result<Self, DispatchError> {
        let workers = workers.max(1);
        let prefix = if name.is_empty() { "stream" } else { name };
        let mut lanes = Vec::with_capacity(workers);

        for index in 0..workers {
            let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
            thread::Builder::new()
                .name(format!("{prefix}-dispatcher-{index}"))
                .spawn(move || {
                    debug!(event = "dispatcher_worker_started", worker = index);
                    while let Some(task) = rx.blocking_recv() {
                        if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                            warn!(
                                event = "dispatcher_task_panicked",
                                worker = index,
                                message = %panic_message(payload.as_ref())
                            );
                        }
                    }
                    debug!(event = "dispatcher_worker_stopped", worker = index);
                })?;
            lanes.push(tx);
        }

        Ok(Self {
            lanes: Mutex::new(Some(lanes)),
            workers,
        })
    }

    /// Enqueues `task` on the worker that owns `session_id`.
    pub fn submit(&self, session_id: u64, task: Task) -> Result<(), DispatchError> {
        let guard = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        let lanes = guard.as_ref().ok_or(DispatchError::ShutDown)?;
        let lane = &lanes[(session_id % lanes.len() as u64) as usize];
        lane.send(task).map_err(|_| DispatchError::ShutDown)
    }

    /// Stops accepting work; queued tasks still run before workers exit.
    pub fn shutdown(&self) {
        let lanes = self
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if lanes.is_some() {
            info!(event = "dispatcher_shutdown", workers = self.workers);
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug, Default)]
struct PoolState {
    dispatcher: Option<Arc<Dispatcher>>,
    active_sessions: usize,
    generation: u64,
}

/// Lazily created, session-counted owner of the shared [`Dispatcher`].
///
/// One pool is owned by a `StreamFactory` and handed to every stream handle
/// it creates. The dispatcher is built on first use and torn down by
/// [`DispatcherPool::shutdown_if_idle`] once no session is active; the check
/// and the teardown happen under the same lock.
#[derive(Debug)]
pub struct DispatcherPool {
    workers: usize,
    name: String,
    state: Mutex<PoolState>,
}

impl DispatcherPool {
    /// `name` prefixes the worker thread names.
    pub fn new(workers: usize, name: impl Into<String>) -> Self {
        Self {
            workers: workers.max(1),
            name: name.into(),
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Registers a new active session and returns the shared dispatcher.
    pub fn acquire(&self) -> Result<Arc<Dispatcher>, DispatchError> {
        let mut state = self.lock();
        if let Some(dispatcher) = state.dispatcher.as_ref() {
            let dispatcher = Arc::clone(dispatcher);
            state.active_sessions += 1;
            return Ok(dispatcher);
        }

        let dispatcher = Arc::new(Dispatcher::new(self.workers, &self.name)?);
        state.generation += 1;
        state.active_sessions += 1;
        info!(
            event = "dispatcher_created",
            workers = self.workers,
            generation = state.generation
        );
        state.dispatcher = Some(Arc::clone(&dispatcher));
        Ok(dispatcher)
    }

    /// Marks one session as no longer active.
    pub fn release(&self) {
        let mut state = self.lock();
        state.active_sessions = state.active_sessions.saturating_sub(1);
    }

    /// Shuts the dispatcher down if no session is active.
    ///
    /// Returns `true` when a running dispatcher was released.
    pub fn shutdown_if_idle(&self) -> bool {
        let mut state = self.lock();
        if state.active_sessions > 0 {
            debug!(
                event = "dispatcher_kept",
                active_sessions = state.active_sessions
            );
            return false;
        }
        match state.dispatcher.take() {
            Some(dispatcher) => {
                dispatcher.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.lock().active_sessions
    }

    pub fn is_running(&self) -> bool {
        self.lock().dispatcher.is_some()
    }

    /// Number of dispatchers created so far.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
