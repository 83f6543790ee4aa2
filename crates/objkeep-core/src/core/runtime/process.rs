use std::{
    io::Read,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};

const MAX_CAPTURE_BYTES: usize = 1024 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillOutcome {
    NotRunning,
    Killed { program: String },
    Failed { program: String, error: String },
}

/// One git invocation slot. `try_kill` may be called from another thread while
/// `invoke` is blocked.
pub trait GitProcess: Send + Sync {
    fn invoke(&self, args: &[String]) -> Result<RunOutput>;
    fn try_kill(&self) -> KillOutcome;
}

pub struct SystemGitProcess {
    program: PathBuf,
    working_dir: PathBuf,
    running: Mutex<Option<Arc<Mutex<Child>>>>,
}

impl SystemGitProcess {
    pub fn new(program: PathBuf, working_dir: &Path) -> Self {
        Self {
            program,
            working_dir: working_dir.to_path_buf(),
            running: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<Mutex<Child>>>> {
        self.running
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }
}

impl GitProcess for SystemGitProcess {
    fn invoke(&self, args: &[String]) -> Result<RunOutput> {
        let program = self.program_name();
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .current_dir(&self.working_dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to start {program}"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout missing for {program}"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr missing for {program}"))?;
        let stdout_handle = thread::spawn(move || read_to_string_limited(stdout, MAX_CAPTURE_BYTES));
        let stderr_handle = thread::spawn(move || read_to_string_limited(stderr, MAX_CAPTURE_BYTES));

        let child = Arc::new(Mutex::new(child));
        *self.slot() = Some(Arc::clone(&child));
        let status = wait_polling(&child, &program);
        self.slot().take();
        let status = status?;

        let code = status.code().unwrap_or(-1);
        let stdout = stdout_handle
            .join()
            .map_err(|_| anyhow!("stdout thread panicked"))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| anyhow!("stderr thread panicked"))??;
        Ok(RunOutput {
            code,
            stdout,
            stderr,
        })
    }

    fn try_kill(&self) -> KillOutcome {
        let Some(child) = self.slot().clone() else {
            return KillOutcome::NotRunning;
        };
        let program = self.program_name();
        let mut child = child
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match child.kill() {
            Ok(()) => KillOutcome::Killed { program },
            Err(err) => KillOutcome::Failed {
                program,
                error: err.to_string(),
            },
        }
    }
}

fn wait_polling(child: &Mutex<Child>, program: &str) -> Result<std::process::ExitStatus> {
    loop {
        let polled = child
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .try_wait()
            .with_context(|| format!("failed to wait for {program}"))?;
        if let Some(status) = polled {
            return Ok(status);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn read_to_string_limited(mut reader: impl Read, limit: usize) -> Result<String> {
    let mut buffer = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        let read = reader.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        let room = limit.saturating_sub(buffer.len());
        if read > room {
            truncated = true;
        }
        buffer.extend_from_slice(&chunk[..read.min(room)]);
    }
    let mut text = String::from_utf8_lossy(&buffer).to_string();
    if truncated {
        text.push_str("\n[...truncated...]\n");
    }
    Ok(text)
}
