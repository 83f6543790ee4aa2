use std::time::Duration;

use anyhow::Result;
use objkeep_domain::Enlistment;
use tracing::{info, warn};

use super::step::{truncate_for_log, MaintenanceStep, StepContext, StepOptions};
use super::time_gate::TimeGate;

pub const FETCH_LAST_RUN_FILE: &str = "fetch.time";
const TIME_BETWEEN_FETCHES: Duration = Duration::from_secs(70 * 60);
const TIME_BETWEEN_FETCHES_NO_CACHE_SERVER: Duration = Duration::from_secs(24 * 60 * 60);

/// Background fetch of every remote into `refs/prefetch/<remote>/*`, blobs
/// filtered out. Plain-git stores only.
pub struct FetchStep {
    options: StepOptions,
}

/// Per-remote result of a fetch round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub fetched: Vec<String>,
    pub failed: Vec<String>,
    pub output: String,
    pub errors: String,
}

impl FetchReport {
    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }
}

impl FetchStep {
    #[must_use]
    pub fn new(options: StepOptions) -> Self {
        Self { options }
    }

    pub(crate) fn fetch_args(remote: &str) -> Vec<String> {
        vec![
            "-c".to_string(),
            "credential.interactive=never".to_string(),
            "fetch".to_string(),
            remote.to_string(),
            "--quiet".to_string(),
            "--prune".to_string(),
            "--no-tags".to_string(),
            "--no-write-fetch-head".to_string(),
            "--no-update-head-ok".to_string(),
            "--filter=blob:none".to_string(),
            format!("+refs/heads/*:refs/prefetch/{remote}/*"),
        ]
    }

    fn fetch_remotes(&self, ctx: &StepContext, remotes: &str) -> Result<FetchReport> {
        let mut report = FetchReport::default();
        for remote in remotes.lines().map(str::trim).filter(|line| !line.is_empty()) {
            info!(area = self.area(), remote, "running fetch for remote");
            let result = ctx.run_git(Self::fetch_args(remote))?;
            if !result.stdout.trim().is_empty() {
                report.output.push_str(&result.stdout);
            }
            if !result.stderr.trim().is_empty() {
                report.errors.push_str(&result.stderr);
            }
            if result.success() {
                report.fetched.push(remote.to_string());
            } else {
                report.failed.push(remote.to_string());
            }
        }
        Ok(report)
    }
}

impl MaintenanceStep for FetchStep {
    fn area(&self) -> &'static str {
        "FetchCommitsAndTreesStep"
    }

    fn progress_message(&self) -> String {
        "Fetching from remotes".to_string()
    }

    fn requires_store_lock(&self) -> bool {
        self.options.requires_store_lock
    }

    fn time_gate(&self, enlistment: &Enlistment) -> Option<TimeGate> {
        let interval = if enlistment.uses_cache_server() {
            TIME_BETWEEN_FETCHES
        } else {
            TIME_BETWEEN_FETCHES_NO_CACHE_SERVER
        };
        Some(TimeGate::new(
            self.area(),
            enlistment.info_dir().join(FETCH_LAST_RUN_FILE),
            interval,
        ))
    }

    fn perform(&self, ctx: &StepContext) -> Result<()> {
        if ctx.enlistment().uses_smart_protocol() {
            info!(area = self.area(), "skipping fetch; objects arrive through the on-demand protocol");
            return Ok(());
        }
        let Some(gate) = self.time_gate(ctx.enlistment()) else {
            return Ok(());
        };
        if !self.options.force_run && !gate.enough_time_between_runs() {
            info!(area = self.area(), "skipping fetch due to not enough time between runs");
            return Ok(());
        }

        let remotes = ctx.run_git(["remote"])?;
        if !remotes.success() {
            warn!(
                area = self.area(),
                stderr = %truncate_for_log(&remotes.stderr),
                "failed to load remotes"
            );
            return Ok(());
        }
        let report = self.fetch_remotes(ctx, &remotes.stdout)?;
        gate.save_last_run_time();
        if report.success() {
            info!(
                area = self.area(),
                remotes = report.fetched.len(),
                "fetched all remotes"
            );
        } else {
            warn!(
                area = self.area(),
                failed = %report.failed.join(","),
                errors = %truncate_for_log(&report.errors),
                "fetch failed for some remotes"
            );
        }
        Ok(())
    }
}
