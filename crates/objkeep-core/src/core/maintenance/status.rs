use anyhow::Result;

use super::step::{MaintenanceStep, StepContext, StepOptions};

/// Refreshes the untracked cache and runs a full status so the next
/// foreground `git status` starts warm.
pub struct StatusStep {
    options: StepOptions,
    untracked_cache: bool,
}

impl StatusStep {
    #[must_use]
    pub fn new(options: StepOptions) -> Self {
        Self {
            options,
            untracked_cache: supports_untracked_cache(),
        }
    }

    #[must_use]
    pub fn with_untracked_cache(mut self, enabled: bool) -> Self {
        self.untracked_cache = enabled;
        self
    }
}

fn supports_untracked_cache() -> bool {
    cfg!(any(unix, windows))
}

impl MaintenanceStep for StatusStep {
    fn area(&self) -> &'static str {
        "StatusStep"
    }

    fn progress_message(&self) -> String {
        "Running 'git status'".to_string()
    }

    fn requires_store_lock(&self) -> bool {
        self.options.requires_store_lock
    }

    // Command failures are logged by run_git and otherwise ignored.
    fn perform(&self, ctx: &StepContext) -> Result<()> {
        if self.untracked_cache {
            ctx.run_git(["update-index", "--untracked-cache"])?;
        }
        ctx.run_git([
            "-c",
            "status.deserializePath=false",
            "status",
            "--porcelain",
            "--untracked-files=all",
        ])?;
        Ok(())
    }
}
