//! Single-consumer FIFO that runs maintenance work serially on one worker
//! thread per repository.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tracing::{debug, error, info};

use super::step::StepExecution;

pub trait QueueTask: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self) -> Result<()>;

    /// Must not block on `execute` returning.
    fn stop(&self);
}

impl QueueTask for StepExecution {
    fn name(&self) -> &str {
        self.area()
    }

    fn execute(&self) -> Result<()> {
        let outcome = StepExecution::execute(self)?;
        debug!(area = self.area(), outcome = outcome.as_str(), "queued step finished");
        Ok(())
    }

    fn stop(&self) {
        StepExecution::stop(self);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueLifecycle {
    Running,
    StopRequested,
    Stopped,
}

struct QueueState {
    pending: VecDeque<Arc<dyn QueueTask>>,
    current: Option<Arc<dyn QueueTask>>,
    lifecycle: QueueLifecycle,
    finished: usize,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.current.is_none()
    }
}

struct Shared {
    state: Mutex<QueueState>,
    available: Condvar,
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct TaskQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Spawn the worker thread; `name` labels it.
    pub fn start(name: &str) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                current: None,
                lifecycle: QueueLifecycle::Running,
                finished: 0,
            }),
            available: Condvar::new(),
            idle: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("objkeep-{name}"))
            .spawn(move || run_worker(&worker_shared))
            .with_context(|| format!("failed to start maintenance worker {name}"))?;
        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Queue `task` behind earlier work. False once stop was requested.
    pub fn try_enqueue(&self, task: Arc<dyn QueueTask>) -> bool {
        let mut state = self.shared.lock();
        if state.lifecycle != QueueLifecycle::Running {
            debug!(task = task.name(), "queue is stopping; rejecting task");
            return false;
        }
        state.pending.push_back(task);
        self.shared.available.notify_one();
        true
    }

    pub fn lifecycle(&self) -> QueueLifecycle {
        self.shared.lock().lifecycle
    }

    pub fn pending(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Tasks the worker has run to completion, successful or not.
    pub fn finished(&self) -> usize {
        self.shared.lock().finished
    }

    /// Block until nothing is pending or running, or the queue stops.
    pub fn wait_idle(&self) {
        let mut state = self.shared.lock();
        while state.lifecycle == QueueLifecycle::Running && !state.is_idle() {
            state = self
                .shared
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Discard pending work, stop the in-flight task and wait for the worker
    /// to exit. Idempotent.
    pub fn stop(&self) {
        let current = {
            let mut state = self.shared.lock();
            if state.lifecycle == QueueLifecycle::Running {
                state.lifecycle = QueueLifecycle::StopRequested;
            }
            let discarded = state.pending.len();
            state.pending.clear();
            if discarded > 0 {
                info!(discarded, "discarding pending maintenance work");
            }
            self.shared.available.notify_all();
            self.shared.idle.notify_all();
            state.current.clone()
        };
        if let Some(task) = current {
            debug!(task = task.name(), "stopping in-flight task");
            task.stop();
        }

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("maintenance worker panicked");
            }
        }
        self.shared.lock().lifecycle = QueueLifecycle::Stopped;
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(shared: &Shared) {
    loop {
        let task = {
            let mut state = shared.lock();
            loop {
                if state.lifecycle != QueueLifecycle::Running {
                    return;
                }
                if let Some(task) = state.pending.pop_front() {
                    state.current = Some(Arc::clone(&task));
                    break task;
                }
                state = shared
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        if let Err(err) = task.execute() {
            error!(task = task.name(), error = %format!("{err:#}"), "maintenance task failed");
        }
        let mut state = shared.lock();
        state.current = None;
        state.finished += 1;
        if state.pending.is_empty() {
            shared.idle.notify_all();
        }
    }
}
