use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use tracing::{debug, error};

/// Minimum spacing between runs, persisted as Unix seconds in `path`.
#[derive(Debug, Clone)]
pub struct TimeGate {
    area: &'static str,
    path: PathBuf,
    interval: Duration,
}

impl TimeGate {
    pub fn new(area: &'static str, path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            area,
            path: path.into(),
            interval,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable records allow a run.
    pub fn enough_time_between_runs(&self) -> bool {
        self.enough_time_at(OffsetDateTime::now_utc().unix_timestamp())
    }

    pub(crate) fn enough_time_at(&self, now: i64) -> bool {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return true,
            Err(err) => {
                error!(area = self.area, path = %self.path.display(), error = %err, "failed to read last run time");
                return true;
            }
        };
        let Ok(last_run) = contents.trim().parse::<i64>() else {
            error!(
                area = self.area,
                path = %self.path.display(),
                contents = contents.trim(),
                "failed to parse last run time"
            );
            return true;
        };
        let interval = i64::try_from(self.interval.as_secs()).unwrap_or(i64::MAX);
        let elapsed = now.saturating_sub(last_run);
        let enough = elapsed >= interval;
        if !enough {
            debug!(area = self.area, elapsed, interval, "not enough time since last run");
        }
        enough
    }

    /// Record now as the last run. Failures are logged, not returned.
    pub fn save_last_run_time(&self) {
        if let Err(err) = self.write_timestamp(OffsetDateTime::now_utc().unix_timestamp()) {
            error!(area = self.area, path = %self.path.display(), error = %format!("{err:#}"), "failed to record run time");
        }
    }

    fn write_timestamp(&self, timestamp: i64) -> Result<()> {
        let parent = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
        let mut tmp = NamedTempFile::new_in(parent)
            .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
        write!(tmp, "{timestamp}")?;
        tmp.flush()?;
        tmp.persist(&self.path)
            .map_err(|err| err.error)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}
