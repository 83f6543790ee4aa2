//! Periodic timers feeding the task queue. The timer thread only builds fresh
//! steps and enqueues them; all execution happens on the queue's worker.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use objkeep_domain::{Enlistment, MaintenanceTask};
use tracing::{debug, info, warn};

use super::queue::{QueueTask, TaskQueue};
use super::registry::StepRegistry;
use super::step::{RepoContext, StepOptions};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub task: MaintenanceTask,
    pub due: Duration,
    pub period: Duration,
}

impl Schedule {
    #[must_use]
    pub fn new(task: MaintenanceTask, due: Duration, period: Duration) -> Self {
        Self { task, due, period }
    }
}

/// Default timer table. Fetch backs off to daily without a cache server.
#[must_use]
pub fn standard_schedules(enlistment: &Enlistment) -> Vec<Schedule> {
    let fetch = if enlistment.uses_cache_server() {
        15 * MINUTE
    } else {
        24 * HOUR
    };
    vec![
        Schedule::new(MaintenanceTask::Fetch, fetch, fetch),
        Schedule::new(MaintenanceTask::LooseObjects, 5 * MINUTE, 6 * HOUR),
        Schedule::new(MaintenanceTask::PackFiles, 30 * MINUTE, 12 * HOUR),
        Schedule::new(MaintenanceTask::CommitGraph, 15 * MINUTE, HOUR),
        Schedule::new(MaintenanceTask::Config, Duration::ZERO, 24 * HOUR),
    ]
}

struct Timer {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct MaintenanceScheduler {
    repo: Arc<RepoContext>,
    registry: Arc<StepRegistry>,
    queue: Arc<TaskQueue>,
    timer: Option<Timer>,
}

impl MaintenanceScheduler {
    pub fn start_standard(repo: Arc<RepoContext>) -> Result<Self> {
        let schedules = standard_schedules(repo.enlistment());
        Self::start(repo, Arc::new(StepRegistry::standard()), schedules)
    }

    /// Start the queue worker and, unless running unattended, the timers.
    pub fn start(
        repo: Arc<RepoContext>,
        registry: Arc<StepRegistry>,
        schedules: Vec<Schedule>,
    ) -> Result<Self> {
        let queue = Arc::new(TaskQueue::start("maintenance")?);
        let mut scheduler = Self {
            repo,
            registry,
            queue,
            timer: None,
        };
        if scheduler.repo.settings().unattended {
            info!("unattended mode; maintenance timers are disabled");
            return Ok(scheduler);
        }
        if schedules.is_empty() {
            return Ok(scheduler);
        }

        let (shutdown, ticks_stop) = bounded::<()>(1);
        let repo = Arc::clone(&scheduler.repo);
        let registry = Arc::clone(&scheduler.registry);
        let queue = Arc::clone(&scheduler.queue);
        let handle = thread::Builder::new()
            .name("objkeep-timers".to_string())
            .spawn(move || {
                let mut next: Vec<Instant> = schedules
                    .iter()
                    .map(|schedule| Instant::now() + schedule.due)
                    .collect();
                loop {
                    let now = Instant::now();
                    let wake_at = next.iter().min().copied().unwrap_or(now);
                    match ticks_stop.recv_timeout(wake_at.saturating_duration_since(now)) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    }
                    let now = Instant::now();
                    for (schedule, due) in schedules.iter().zip(next.iter_mut()) {
                        if *due > now {
                            continue;
                        }
                        *due = now + schedule.period.max(MIN_PERIOD);
                        debug!(task = schedule.task.as_str(), "maintenance timer fired");
                        if !enqueue(&registry, &repo, &queue, schedule.task, StepOptions::default()) {
                            return;
                        }
                    }
                }
            })
            .context("failed to start maintenance timers")?;
        scheduler.timer = Some(Timer { shutdown, handle });
        Ok(scheduler)
    }

    /// Queue one run of `task` outside the timers, e.g. from a user request.
    pub fn enqueue_one_time(&self, task: MaintenanceTask, options: StepOptions) -> bool {
        enqueue(&self.registry, &self.repo, &self.queue, task, options)
    }

    pub fn timers_running(&self) -> bool {
        self.timer.is_some()
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Stop the timers, then the queue and any in-flight step.
    pub fn shutdown(&mut self) {
        if let Some(timer) = self.timer.take() {
            let _ = timer.shutdown.send(());
            if timer.handle.join().is_err() {
                warn!("maintenance timer thread panicked");
            }
        }
        self.queue.stop();
    }
}

impl Drop for MaintenanceScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn enqueue(
    registry: &StepRegistry,
    repo: &Arc<RepoContext>,
    queue: &TaskQueue,
    task: MaintenanceTask,
    options: StepOptions,
) -> bool {
    let Some(execution) = registry.create(task, repo, options) else {
        warn!(task = task.as_str(), "no maintenance step registered for task");
        return true;
    };
    let execution: Arc<dyn QueueTask> = Arc::new(execution);
    let accepted = queue.try_enqueue(execution);
    if !accepted {
        debug!(task = task.as_str(), "queue closed; dropping maintenance task");
    }
    accepted
}
