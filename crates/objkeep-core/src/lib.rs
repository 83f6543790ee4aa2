#![deny(clippy::all, warnings)]

mod core;

pub use crate::core::commands::{
    download_object, run_maintenance, watch, DownloadRequest, MaintenanceRequest, Session,
};
pub use crate::core::config::{
    Config, MaintenanceConfig, NetworkConfig, StoreConfig, DEFAULT_HTTP_TIMEOUT,
    DEFAULT_PACK_BATCH_SIZE, DEFAULT_RETRY_ATTEMPTS,
};
pub use crate::core::runtime::effects::{
    Effects, GitLauncher, LayoutGate, ProcessProbe, SystemEffects, CURRENT_DISK_LAYOUT_VERSION,
};
pub use crate::core::runtime::process::{GitProcess, KillOutcome, RunOutput, SystemGitProcess};
pub use crate::core::tooling::outcome::{CommandStatus, ExecutionOutcome};

pub mod maintenance {
    pub use crate::core::maintenance::*;
}

pub mod objects {
    pub use crate::core::objects::*;
}

pub use objkeep_domain::{
    Enlistment, LooseObjectInventory, MaintenanceTask, ObjectId, PackFileInventory,
};
