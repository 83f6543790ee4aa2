//! Entry points the CLI dispatches to. Each returns an [`ExecutionOutcome`];
//! `Err` is reserved for failures the user cannot act on.

use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use objkeep_domain::{Enlistment, MaintenanceTask, ObjectId};
use serde_json::json;
use tracing::{info, warn};

use crate::core::config::Config;
use crate::core::maintenance::{MaintenanceScheduler, RepoContext, StepOptions, StepOutcome, StepRegistry};
use crate::core::objects::{
    CancellationToken, DownloadError, FetchOutcome, ObjectDownloader, RequestSource,
};
use crate::core::runtime::effects::{Effects, SystemEffects};
use crate::core::tooling::outcome::ExecutionOutcome;

/// Configuration, collaborators and enlistment for one command invocation.
pub struct Session {
    config: Config,
    enlistment: Enlistment,
    effects: Arc<dyn Effects>,
}

impl Session {
    /// Session over the enlistment at `root`, configured from the environment.
    pub fn open(root: &Path) -> Result<Self> {
        let config = Config::from_env()?;
        Self::with_effects(root, config, Arc::new(SystemEffects::new()))
    }

    pub fn with_effects(root: &Path, config: Config, effects: Arc<dyn Effects>) -> Result<Self> {
        let enlistment = config
            .enlistment(root)
            .with_context(|| format!("failed to open enlistment at {}", root.display()))?;
        Ok(Self {
            config,
            enlistment,
            effects,
        })
    }

    pub fn enlistment(&self) -> &Enlistment {
        &self.enlistment
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn repo(&self) -> Arc<RepoContext> {
        Arc::new(RepoContext::new(
            self.enlistment.clone(),
            Arc::clone(&self.effects),
            *self.config.maintenance(),
        ))
    }

    /// A user-facing refusal when the store cannot be maintained as-is.
    fn store_problem(&self) -> Result<Option<ExecutionOutcome>> {
        let objects_root = self.enlistment.objects_root();
        if !objects_root.is_dir() {
            return Ok(Some(ExecutionOutcome::user_error(
                format!("object store not found at {objects_root}"),
                json!({
                    "objects_root": objects_root.as_str(),
                    "hint": "run from an enlistment root or set OBJKEEP_OBJECTS_ROOT",
                }),
            )));
        }
        if !self.effects.layout().is_current(&self.enlistment)? {
            return Ok(Some(ExecutionOutcome::user_error(
                "object store uses an outdated disk layout; upgrade it before running maintenance",
                json!({ "objects_root": objects_root.as_str() }),
            )));
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MaintenanceRequest {
    pub task: MaintenanceTask,
    pub force: bool,
}

/// Run one maintenance task in the foreground.
pub fn run_maintenance(session: &Session, request: &MaintenanceRequest) -> Result<ExecutionOutcome> {
    if let Some(problem) = session.store_problem()? {
        return Ok(problem);
    }
    let options = StepOptions {
        force_run: request.force,
        ..StepOptions::default()
    };
    let registry = StepRegistry::standard();
    let Some(execution) = registry.create(request.task, &session.repo(), options) else {
        return Ok(ExecutionOutcome::user_error(
            format!("no maintenance step for task {}", request.task),
            json!({ "task": request.task }),
        ));
    };

    let outcome = execution.execute()?;
    let details = json!({
        "task": request.task,
        "area": execution.area(),
        "outcome": outcome,
        "forced": request.force,
    });
    Ok(match outcome {
        StepOutcome::Completed => {
            ExecutionOutcome::success(format!("{} finished", request.task), details)
        }
        StepOutcome::SkippedLocked => ExecutionOutcome::success(
            format!("{} skipped: another process holds the maintenance lock", request.task),
            details,
        ),
        StepOutcome::Stopped => {
            ExecutionOutcome::success(format!("{} stopped", request.task), details)
        }
        StepOutcome::Incomplete => ExecutionOutcome::failure(
            format!("{} did not complete; see the log for details", request.task),
            details,
        ),
    })
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub object_id: String,
    pub source: RequestSource,
}

/// Download one loose object into the store.
pub fn download_object(session: &Session, request: &DownloadRequest) -> Result<ExecutionOutcome> {
    let id = match ObjectId::parse(&request.object_id) {
        Ok(id) => id,
        Err(err) => {
            return Ok(ExecutionOutcome::user_error(
                err.to_string(),
                json!({ "object_id": request.object_id }),
            ))
        }
    };
    let downloader = match ObjectDownloader::new(session.enlistment.clone(), session.config.network()) {
        Ok(downloader) => downloader,
        Err(err) => {
            return Ok(ExecutionOutcome::user_error(
                format!("{err:#}"),
                json!({ "object_id": id.as_str() }),
            ))
        }
    };

    Ok(match downloader.fetch_and_store(&id, request.source, &CancellationToken::new()) {
        Ok(outcome) => {
            let message = match &outcome {
                FetchOutcome::Stored { bytes, .. } => format!("downloaded {id} ({bytes} bytes)"),
                FetchOutcome::AlreadyPresent { .. } => format!("{id} is already present"),
                FetchOutcome::ObjectNotOnServer => format!("{id} is not on the object server"),
            };
            let details = json!({ "object_id": id.as_str(), "outcome": outcome });
            ExecutionOutcome::success(message, details)
        }
        Err(DownloadError::NullObjectId) => ExecutionOutcome::user_error(
            DownloadError::NullObjectId.to_string(),
            json!({ "object_id": id.as_str() }),
        ),
        Err(err) => ExecutionOutcome::failure(
            format!("{:#}", anyhow::Error::from(err)),
            json!({ "object_id": id.as_str() }),
        ),
    })
}

/// Run the scheduler until `input` ends or says `stop`. Other lines name a
/// task to queue, optionally followed by `--force`. Queued work finishes
/// before the scheduler shuts down.
pub fn watch(session: &Session, input: impl BufRead) -> Result<ExecutionOutcome> {
    if let Some(problem) = session.store_problem()? {
        return Ok(problem);
    }
    let mut scheduler = MaintenanceScheduler::start_standard(session.repo())?;
    info!(
        timers = scheduler.timers_running(),
        "maintenance scheduler started"
    );

    let mut enqueued = Vec::new();
    let mut rejected = Vec::new();
    for line in input.lines() {
        let line = line.context("failed to read maintenance requests")?;
        let mut words = line.split_whitespace();
        let Some(word) = words.next() else {
            continue;
        };
        if word == "stop" {
            break;
        }
        let force = words.any(|flag| flag == "--force");
        match word.parse::<MaintenanceTask>() {
            Ok(task) => {
                let options = StepOptions {
                    force_run: force,
                    ..StepOptions::default()
                };
                if scheduler.enqueue_one_time(task, options) {
                    enqueued.push(task);
                } else {
                    rejected.push(word.to_string());
                }
            }
            Err(err) => {
                warn!(error = %err, "ignoring maintenance request");
                rejected.push(word.to_string());
            }
        }
    }
    scheduler.queue().wait_idle();
    let finished = scheduler.queue().finished();
    scheduler.shutdown();

    Ok(ExecutionOutcome::success(
        format!("scheduler stopped after running {finished} tasks"),
        json!({
            "enqueued": enqueued,
            "rejected": rejected,
            "finished": finished,
            "timers": !session.config.maintenance().unattended,
        }),
    ))
}
