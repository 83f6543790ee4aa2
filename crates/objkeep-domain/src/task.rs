use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Closed set of maintenance tasks the CLI layer may request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MaintenanceTask {
    Fetch,
    LooseObjects,
    PackFiles,
    CommitGraph,
    Config,
    Status,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown maintenance task '{0}' (expected one of: fetch, loose-objects, pack-files, commit-graph, config, status)")]
pub struct TaskParseError(pub String);

impl MaintenanceTask {
    pub const ALL: [Self; 6] = [
        Self::Fetch,
        Self::LooseObjects,
        Self::PackFiles,
        Self::CommitGraph,
        Self::Config,
        Self::Status,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::LooseObjects => "loose-objects",
            Self::PackFiles => "pack-files",
            Self::CommitGraph => "commit-graph",
            Self::Config => "config",
            Self::Status => "status",
        }
    }
}

impl fmt::Display for MaintenanceTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MaintenanceTask {
    type Err = TaskParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|task| task.as_str() == s)
            .ok_or_else(|| TaskParseError(s.to_string()))
    }
}
