//! In-process doubles for git, the process table and the layout gate.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use objkeep_domain::Enlistment;

use super::step::{MaintenanceStep, RepoContext, StepContext};
use crate::core::config::MaintenanceConfig;
use crate::core::runtime::effects::{Effects, GitLauncher, LayoutGate, ProcessProbe};
use crate::core::runtime::process::{GitProcess, KillOutcome, RunOutput};

type Responder = Box<dyn Fn(&[String]) -> RunOutput + Send + Sync>;

#[derive(Default)]
pub(crate) struct FakeGit {
    commands: Mutex<Vec<Vec<String>>>,
    responder: Mutex<Option<Responder>>,
}

impl FakeGit {
    pub(crate) fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().expect("commands lock").clone()
    }

    /// Commands joined with spaces, for readable assertions.
    pub(crate) fn command_lines(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .map(|args| args.join(" "))
            .collect()
    }

    pub(crate) fn respond_with(&self, responder: impl Fn(&[String]) -> RunOutput + Send + Sync + 'static) {
        *self.responder.lock().expect("responder lock") = Some(Box::new(responder));
    }
}

impl GitProcess for FakeGit {
    fn invoke(&self, args: &[String]) -> Result<RunOutput> {
        self.commands
            .lock()
            .expect("commands lock")
            .push(args.to_vec());
        let responder = self.responder.lock().expect("responder lock");
        Ok(responder
            .as_ref()
            .map_or_else(|| ok(""), |respond| respond(args)))
    }

    fn try_kill(&self) -> KillOutcome {
        KillOutcome::NotRunning
    }
}

pub(crate) fn ok(stdout: &str) -> RunOutput {
    RunOutput {
        code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub(crate) fn failed(stderr: &str) -> RunOutput {
    RunOutput {
        code: 1,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

struct FakeLauncher {
    git: Arc<FakeGit>,
}

impl GitLauncher for FakeLauncher {
    fn launch(&self, _enlistment: &Enlistment) -> Result<Arc<dyn GitProcess>> {
        let git: Arc<dyn GitProcess> = self.git.clone();
        Ok(git)
    }
}

#[derive(Default)]
pub(crate) struct FakeProbe {
    pids: Mutex<Vec<u32>>,
}

impl ProcessProbe for FakeProbe {
    fn running_git_pids(&self) -> Result<Vec<u32>> {
        Ok(self.pids.lock().expect("pids lock").clone())
    }
}

struct FakeLayout {
    current: AtomicBool,
}

impl LayoutGate for FakeLayout {
    fn is_current(&self, _enlistment: &Enlistment) -> Result<bool> {
        Ok(self.current.load(Ordering::SeqCst))
    }
}

pub(crate) struct FakeEffects {
    pub(crate) git: Arc<FakeGit>,
    pub(crate) probe: FakeProbe,
    launcher: FakeLauncher,
    layout: FakeLayout,
}

impl Default for FakeEffects {
    fn default() -> Self {
        let git = Arc::new(FakeGit::default());
        Self {
            launcher: FakeLauncher { git: git.clone() },
            git,
            probe: FakeProbe::default(),
            layout: FakeLayout {
                current: AtomicBool::new(true),
            },
        }
    }
}

impl FakeEffects {
    pub(crate) fn with_running_git(self, pids: &[u32]) -> Self {
        *self.probe.pids.lock().expect("pids lock") = pids.to_vec();
        self
    }

    pub(crate) fn with_outdated_layout(self) -> Self {
        self.layout.current.store(false, Ordering::SeqCst);
        self
    }
}

impl Effects for FakeEffects {
    fn git(&self) -> &dyn GitLauncher {
        &self.launcher
    }

    fn processes(&self) -> &dyn ProcessProbe {
        &self.probe
    }

    fn layout(&self) -> &dyn LayoutGate {
        &self.layout
    }
}

/// Repository rooted at `root` with an existing, empty object store.
pub(crate) fn repo(
    root: &Path,
    effects: &Arc<FakeEffects>,
    configure: impl FnOnce(Enlistment) -> Enlistment,
) -> Result<Arc<RepoContext>> {
    let enlistment = configure(Enlistment::from_path(root)?);
    fs::create_dir_all(enlistment.pack_root())?;
    fs::create_dir_all(enlistment.info_dir())?;
    Ok(Arc::new(RepoContext::new(
        enlistment,
        effects.clone(),
        MaintenanceConfig::default(),
    )))
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum StepBehavior {
    RunCommand,
    StopDuringCommand,
    FailIo,
    FailLogic,
    FailLogicAfterRemovingStore,
}

#[derive(Default)]
pub(crate) struct StepProbe {
    pub(crate) performed: AtomicBool,
    pub(crate) saw_work: AtomicBool,
    pub(crate) completed: AtomicBool,
}

pub(crate) struct RecordingStep {
    behavior: StepBehavior,
    probe: Arc<StepProbe>,
}

impl RecordingStep {
    pub(crate) fn new(behavior: StepBehavior) -> (Self, Arc<StepProbe>) {
        let probe = Arc::new(StepProbe::default());
        (
            Self {
                behavior,
                probe: probe.clone(),
            },
            probe,
        )
    }
}

impl MaintenanceStep for RecordingStep {
    fn area(&self) -> &'static str {
        "RecordingStep"
    }

    fn progress_message(&self) -> String {
        "Recording".to_string()
    }

    fn requires_store_lock(&self) -> bool {
        true
    }

    fn perform(&self, ctx: &StepContext) -> Result<()> {
        self.probe.performed.store(true, Ordering::SeqCst);
        match self.behavior {
            StepBehavior::RunCommand => {
                ctx.run_git(["version"])?;
            }
            StepBehavior::StopDuringCommand => {
                ctx.run_git_with("probe", |_| {
                    self.probe.saw_work.store(true, Ordering::SeqCst);
                    ctx.stop();
                    Ok(ok(""))
                })?;
            }
            StepBehavior::FailIo => {
                return Err(io::Error::other("disk unplugged").into());
            }
            StepBehavior::FailLogic => return Err(anyhow!("broken invariant")),
            StepBehavior::FailLogicAfterRemovingStore => {
                fs::remove_dir_all(ctx.enlistment().objects_root())?;
                return Err(anyhow!("broken invariant"));
            }
        }
        self.probe.completed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
