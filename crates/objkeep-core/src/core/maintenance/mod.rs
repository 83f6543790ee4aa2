pub mod commit_graph;
pub mod config_step;
pub mod fetch;
pub mod lock;
pub mod loose_objects;
pub mod packfiles;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod status;
pub mod step;
pub mod time_gate;

#[cfg(test)]
pub(crate) mod testing;

pub use commit_graph::CommitGraphStep;
pub use config_step::{ConfigStep, LocalConfig, SMART_PROTOCOL_CORE_FLAGS};
pub use fetch::{FetchReport, FetchStep};
pub use lock::{maintenance_lock_path, CrossProcessLock, MAINTENANCE_LOCK_FILE};
pub use loose_objects::{LooseObjectsStep, DEFAULT_MAX_LOOSE_OBJECTS_IN_PACK};
pub use packfiles::{
    clean_stale_idx_files, effective_batch_size, plan_repack_batch, repack_candidates,
    PackfileMaintenanceStep,
};
pub use queue::{QueueLifecycle, QueueTask, TaskQueue};
pub use registry::{StepFactory, StepRegistry};
pub use scheduler::{standard_schedules, MaintenanceScheduler, Schedule};
pub use status::StatusStep;
pub use step::{
    MaintenanceStep, RepoContext, StepContext, StepExecution, StepInterrupt, StepOptions,
    StepOutcome,
};
pub use time_gate::TimeGate;
