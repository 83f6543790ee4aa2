//! The maintenance step contract: locking, stop semantics and the failure
//! boundary shared by every step.

use std::borrow::Cow;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use objkeep_domain::{Enlistment, LooseObjectInventory, PackFileInventory};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};

use super::lock::{maintenance_lock_path, CrossProcessLock};
use super::time_gate::TimeGate;
use crate::core::config::MaintenanceConfig;
use crate::core::runtime::effects::Effects;
use crate::core::runtime::process::{GitProcess, KillOutcome, RunOutput};

const LOGGED_STDERR_HALF: usize = 500;

/// Immutable per-repository state shared by every step instance.
pub struct RepoContext {
    enlistment: Enlistment,
    effects: Arc<dyn Effects>,
    settings: MaintenanceConfig,
}

impl RepoContext {
    pub fn new(enlistment: Enlistment, effects: Arc<dyn Effects>, settings: MaintenanceConfig) -> Self {
        Self {
            enlistment,
            effects,
            settings,
        }
    }

    pub fn enlistment(&self) -> &Enlistment {
        &self.enlistment
    }

    pub fn effects(&self) -> &dyn Effects {
        self.effects.as_ref()
    }

    pub fn settings(&self) -> &MaintenanceConfig {
        &self.settings
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOptions {
    pub force_run: bool,
    pub requires_store_lock: bool,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            force_run: false,
            requires_store_lock: true,
        }
    }
}

impl StepOptions {
    #[must_use]
    pub fn forced() -> Self {
        Self {
            force_run: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    SkippedLocked,
    Stopped,
    Incomplete,
}

impl StepOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::SkippedLocked => "skipped-locked",
            Self::Stopped => "stopped",
            Self::Incomplete => "incomplete",
        }
    }
}

/// Raised inside a routine once its step has been asked to stop.
#[derive(Debug, thiserror::Error)]
#[error("{area}: maintenance step is stopping")]
pub struct StepInterrupt {
    pub area: &'static str,
}

pub trait MaintenanceStep: Send + Sync {
    fn area(&self) -> &'static str;

    fn progress_message(&self) -> String;

    fn requires_store_lock(&self) -> bool;

    /// Spacing enforced between runs, if any.
    fn time_gate(&self, _enlistment: &Enlistment) -> Option<TimeGate> {
        None
    }

    fn perform(&self, ctx: &StepContext) -> Result<()>;
}

#[derive(Default)]
struct Control {
    stopping: bool,
    process: Option<Arc<dyn GitProcess>>,
}

/// Per-execution handle a routine uses to reach git and the store.
pub struct StepContext {
    repo: Arc<RepoContext>,
    area: &'static str,
    control: Mutex<Control>,
}

impl StepContext {
    fn new(repo: Arc<RepoContext>, area: &'static str) -> Self {
        Self {
            repo,
            area,
            control: Mutex::new(Control::default()),
        }
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn area(&self) -> &'static str {
        self.area
    }

    pub fn repo(&self) -> &RepoContext {
        &self.repo
    }

    pub fn enlistment(&self) -> &Enlistment {
        self.repo.enlistment()
    }

    pub fn is_stopping(&self) -> bool {
        self.control().stopping
    }

    pub fn stop(&self) {
        let mut control = self.control();
        control.stopping = true;
        let Some(process) = control.process.clone() else {
            return;
        };
        match process.try_kill() {
            KillOutcome::NotRunning => {}
            KillOutcome::Killed { program } => {
                info!(area = self.area, program = %program, "killed in-flight git process");
            }
            KillOutcome::Failed { program, error } => {
                warn!(area = self.area, program = %program, error = %error, "failed to kill in-flight git process");
            }
        }
    }

    pub fn interrupt(&self) -> anyhow::Error {
        StepInterrupt { area: self.area }.into()
    }

    /// Run git with `args`, honouring the stop flag before and after.
    pub fn run_git<I, S>(&self, args: I) -> Result<RunOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let label = command_label(&args);
        self.run_git_with(&label, |git| git.invoke(&args))
    }

    /// Like [`Self::run_git`] but hands the raw process slot to `work`.
    pub fn run_git_with(
        &self,
        label: &str,
        work: impl FnOnce(&dyn GitProcess) -> Result<RunOutput>,
    ) -> Result<RunOutput> {
        let process = {
            let control = self.control();
            if control.stopping {
                warn!(area = self.area, command = label, "not launching git command; step is stopping");
                return Err(self.interrupt());
            }
            control
                .process
                .clone()
                .ok_or_else(|| anyhow!("{}: git is only available while the step runs", self.area))?
        };

        debug!(area = self.area, command = label, "running git");
        let output = work(process.as_ref()).with_context(|| format!("git {label} failed to run"))?;
        if self.is_stopping() {
            return Err(self.interrupt());
        }
        if !output.success() {
            warn!(
                area = self.area,
                command = label,
                code = output.code,
                stderr = %truncate_for_log(&output.stderr),
                "git command failed"
            );
        }
        Ok(output)
    }

    pub fn pack_inventory(&self) -> Result<PackFileInventory> {
        let pack_root = self.enlistment().pack_root();
        PackFileInventory::scan(pack_root.as_std_path())
            .with_context(|| format!("failed to scan {pack_root}"))
    }

    pub fn loose_object_inventory(&self) -> Result<LooseObjectInventory> {
        let objects_root = self.enlistment().objects_root();
        LooseObjectInventory::scan(objects_root.as_std_path())
            .with_context(|| format!("failed to scan {objects_root}"))
    }

    /// Pids of foreground git processes; maintenance yields to them.
    pub fn running_git_pids(&self) -> Result<Vec<u32>> {
        self.repo.effects().processes().running_git_pids()
    }

    /// Whether an unforced run should yield: the gate has not elapsed or
    /// foreground git processes are active.
    pub fn should_defer(&self, gate: &TimeGate) -> Result<bool> {
        if !gate.enough_time_between_runs() {
            warn!(area = self.area, "skipping due to not enough time between runs");
            return Ok(true);
        }
        let pids = self.running_git_pids()?;
        if !pids.is_empty() {
            let pids = pids
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            warn!(area = self.area, pids = %pids, "skipping due to running git processes");
            return Ok(true);
        }
        Ok(false)
    }

    pub fn enlistment_root_ready(&self) -> bool {
        let enlistment = self.enlistment();
        enlistment.root().is_dir() && enlistment.objects_root().is_dir()
    }

    fn attach(&self, process: Arc<dyn GitProcess>) -> bool {
        let mut control = self.control();
        if control.stopping {
            return false;
        }
        control.process = Some(process);
        true
    }

    fn detach(&self) {
        self.control().process = None;
    }
}

/// One step instance bound to its repository. Executes at most once.
pub struct StepExecution {
    ctx: StepContext,
    step: Box<dyn MaintenanceStep>,
}

impl StepExecution {
    pub fn new(repo: Arc<RepoContext>, step: Box<dyn MaintenanceStep>) -> Self {
        Self {
            ctx: StepContext::new(repo, step.area()),
            step,
        }
    }

    pub fn area(&self) -> &'static str {
        self.step.area()
    }

    pub fn context(&self) -> &StepContext {
        &self.ctx
    }

    pub fn requires_store_lock(&self) -> bool {
        self.step.requires_store_lock()
    }

    /// Ask the step to stop; kills an in-flight git process. Never blocks on
    /// the routine itself.
    pub fn stop(&self) {
        self.ctx.stop();
    }

    /// # Errors
    /// Returns an error only for unexpected failures while the enlistment and
    /// its object store are both reachable.
    pub fn execute(&self) -> Result<StepOutcome> {
        let span = info_span!("maintenance", area = self.area());
        let _entered = span.enter();
        match self.run_guarded() {
            Ok(outcome) => Ok(outcome),
            Err(err) => self.classify_failure(err),
        }
    }

    fn run_guarded(&self) -> Result<StepOutcome> {
        let _lock = if self.step.requires_store_lock() {
            let path = maintenance_lock_path(self.ctx.enlistment().objects_root().as_std_path());
            match CrossProcessLock::try_acquire(&path)? {
                Some(lock) => Some(lock),
                None => {
                    info!(area = self.area(), "skipping work since another process holds the lock");
                    return Ok(StepOutcome::SkippedLocked);
                }
            }
        } else {
            None
        };

        if self.ctx.is_stopping() {
            debug!(area = self.area(), "stopped before start");
            return Ok(StepOutcome::Stopped);
        }
        let process = self
            .ctx
            .repo
            .effects()
            .git()
            .launch(self.ctx.enlistment())?;
        if !self.ctx.attach(process) {
            return Ok(StepOutcome::Stopped);
        }

        info!(area = self.area(), message = %self.step.progress_message(), "starting maintenance step");
        let result = self.step.perform(&self.ctx);
        self.ctx.detach();
        result?;
        if self.ctx.is_stopping() {
            return Ok(StepOutcome::Stopped);
        }
        Ok(StepOutcome::Completed)
    }

    fn classify_failure(&self, err: anyhow::Error) -> Result<StepOutcome> {
        let area = self.area();
        if err.chain().any(|cause| cause.is::<StepInterrupt>()) {
            info!(area, "maintenance step stopped");
            return Ok(StepOutcome::Stopped);
        }
        if err.chain().any(|cause| cause.is::<io::Error>()) {
            warn!(area, error = %format!("{err:#}"), "maintenance step hit an I/O failure");
            return Ok(StepOutcome::Incomplete);
        }
        if self.ctx.enlistment_root_ready() {
            error!(area, error = %format!("{err:#}"), "maintenance step failed");
            return Err(err.context(format!("{area} maintenance failed")));
        }
        warn!(
            area,
            error = %format!("{err:#}"),
            "maintenance step failed while the enlistment is unavailable"
        );
        Ok(StepOutcome::Incomplete)
    }
}

fn command_label(args: &[String]) -> String {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-c" {
            iter.next();
            continue;
        }
        return arg.clone();
    }
    String::new()
}

/// Keep the first and last 500 characters of long stderr.
pub(crate) fn truncate_for_log(message: &str) -> Cow<'_, str> {
    let total = message.chars().count();
    if total <= LOGGED_STDERR_HALF * 2 {
        return Cow::Borrowed(message);
    }
    let beginning: String = message.chars().take(LOGGED_STDERR_HALF).collect();
    let ending: String = message.chars().skip(total - LOGGED_STDERR_HALF).collect();
    Cow::Owned(format!("beginning: {beginning} ending: {ending}"))
}
