use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use objkeep_domain::Enlistment;

use super::process::{GitProcess, SystemGitProcess};

/// Disk layout version this build understands.
pub const CURRENT_DISK_LAYOUT_VERSION: u32 = 1;
const LAYOUT_VERSION_FILE: &str = "disk-layout-version";
const METADATA_DIR: &str = "objkeep";

pub trait GitLauncher: Send + Sync {
    /// A fresh git invocation slot bound to the enlistment's working directory.
    fn launch(&self, enlistment: &Enlistment) -> Result<Arc<dyn GitProcess>>;
}

pub trait ProcessProbe: Send + Sync {
    /// Pids of `git` processes currently running on this machine.
    fn running_git_pids(&self) -> Result<Vec<u32>>;
}

pub trait LayoutGate: Send + Sync {
    fn is_current(&self, enlistment: &Enlistment) -> Result<bool>;
}

pub trait Effects: Send + Sync {
    fn git(&self) -> &dyn GitLauncher;
    fn processes(&self) -> &dyn ProcessProbe;
    fn layout(&self) -> &dyn LayoutGate;
}

pub struct SystemEffects {
    git: Arc<SystemGitLauncher>,
    processes: Arc<SystemProcessProbe>,
    layout: Arc<SystemLayoutGate>,
}

impl SystemEffects {
    #[must_use]
    pub fn new() -> Self {
        Self {
            git: Arc::new(SystemGitLauncher),
            processes: Arc::new(SystemProcessProbe),
            layout: Arc::new(SystemLayoutGate),
        }
    }
}

impl Default for SystemEffects {
    fn default() -> Self {
        Self::new()
    }
}

impl Effects for SystemEffects {
    fn git(&self) -> &dyn GitLauncher {
        self.git.as_ref()
    }

    fn processes(&self) -> &dyn ProcessProbe {
        self.processes.as_ref()
    }

    fn layout(&self) -> &dyn LayoutGate {
        self.layout.as_ref()
    }
}

struct SystemGitLauncher;

impl GitLauncher for SystemGitLauncher {
    fn launch(&self, enlistment: &Enlistment) -> Result<Arc<dyn GitProcess>> {
        let program = resolve_git()?;
        Ok(Arc::new(SystemGitProcess::new(
            program,
            enlistment.working_dir().as_std_path(),
        )))
    }
}

fn resolve_git() -> Result<PathBuf> {
    which::which("git").context("git executable not found on PATH")
}

struct SystemProcessProbe;

impl ProcessProbe for SystemProcessProbe {
    fn running_git_pids(&self) -> Result<Vec<u32>> {
        let own = std::process::id();
        let pids = list_git_pids()?;
        Ok(pids.into_iter().filter(|pid| *pid != own).collect())
    }
}

#[cfg(target_os = "linux")]
fn list_git_pids() -> Result<Vec<u32>> {
    let mut pids = Vec::new();
    for entry in fs::read_dir("/proc").context("failed to list /proc")? {
        let entry = entry?;
        let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse::<u32>().ok()) else {
            continue;
        };
        // processes can exit between the listing and the read
        let Ok(comm) = fs::read_to_string(entry.path().join("comm")) else {
            continue;
        };
        if comm.trim() == "git" {
            pids.push(pid);
        }
    }
    Ok(pids)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn list_git_pids() -> Result<Vec<u32>> {
    let output = std::process::Command::new("ps")
        .args(["-A", "-o", "pid=,comm="])
        .output()
        .context("failed to run ps")?;
    let listing = String::from_utf8_lossy(&output.stdout);
    Ok(listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse::<u32>().ok()?;
            let command = fields.next()?;
            let name = command.rsplit('/').next().unwrap_or(command);
            (name == "git").then_some(pid)
        })
        .collect())
}

#[cfg(windows)]
fn list_git_pids() -> Result<Vec<u32>> {
    let output = std::process::Command::new("tasklist")
        .args(["/FI", "IMAGENAME eq git.exe", "/FO", "CSV", "/NH"])
        .output()
        .context("failed to run tasklist")?;
    let listing = String::from_utf8_lossy(&output.stdout);
    Ok(listing
        .lines()
        .filter_map(|line| {
            let pid = line.split(',').nth(1)?.trim_matches('"');
            pid.parse::<u32>().ok()
        })
        .collect())
}

struct SystemLayoutGate;

impl LayoutGate for SystemLayoutGate {
    fn is_current(&self, enlistment: &Enlistment) -> Result<bool> {
        let path = enlistment
            .dot_git()
            .join(METADATA_DIR)
            .join(LAYOUT_VERSION_FILE);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(err).with_context(|| format!("failed to read {path}")),
        };
        let major = contents
            .trim()
            .split('.')
            .next()
            .unwrap_or_default()
            .parse::<u32>()
            .with_context(|| format!("{path} does not hold a layout version"))?;
        Ok(major == CURRENT_DISK_LAYOUT_VERSION)
    }
}
