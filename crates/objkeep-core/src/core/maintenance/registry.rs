use std::collections::HashMap;
use std::sync::Arc;

use objkeep_domain::MaintenanceTask;

use super::commit_graph::CommitGraphStep;
use super::config_step::ConfigStep;
use super::fetch::FetchStep;
use super::loose_objects::LooseObjectsStep;
use super::packfiles::PackfileMaintenanceStep;
use super::status::StatusStep;
use super::step::{MaintenanceStep, RepoContext, StepExecution, StepOptions};

pub type StepFactory =
    Box<dyn Fn(&RepoContext, StepOptions) -> Box<dyn MaintenanceStep> + Send + Sync>;

/// Task name to step constructor. Built once, read-only afterwards.
pub struct StepRegistry {
    factories: HashMap<MaintenanceTask, StepFactory>,
}

impl StepRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    #[must_use]
    pub fn standard() -> Self {
        Self::empty()
            .with(MaintenanceTask::Fetch, |_, options| {
                Box::new(FetchStep::new(options))
            })
            .with(MaintenanceTask::LooseObjects, |_, options| {
                Box::new(LooseObjectsStep::new(options))
            })
            .with(MaintenanceTask::PackFiles, |repo, options| {
                Box::new(PackfileMaintenanceStep::new(
                    options,
                    repo.settings().pack_batch_size,
                ))
            })
            .with(MaintenanceTask::CommitGraph, |_, options| {
                Box::new(CommitGraphStep::new(options))
            })
            .with(MaintenanceTask::Config, |_, options| {
                Box::new(ConfigStep::new(without_store_lock(options)))
            })
            .with(MaintenanceTask::Status, |_, options| {
                Box::new(StatusStep::new(without_store_lock(options)))
            })
    }

    #[must_use]
    pub fn with(
        mut self,
        task: MaintenanceTask,
        factory: impl Fn(&RepoContext, StepOptions) -> Box<dyn MaintenanceStep> + Send + Sync + 'static,
    ) -> Self {
        self.factories.insert(task, Box::new(factory));
        self
    }

    pub fn contains(&self, task: MaintenanceTask) -> bool {
        self.factories.contains_key(&task)
    }

    /// A fresh, not yet executed step for `task`.
    pub fn create(
        &self,
        task: MaintenanceTask,
        repo: &Arc<RepoContext>,
        options: StepOptions,
    ) -> Option<StepExecution> {
        let factory = self.factories.get(&task)?;
        Some(StepExecution::new(repo.clone(), factory(repo, options)))
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

fn without_store_lock(options: StepOptions) -> StepOptions {
    StepOptions {
        requires_store_lock: false,
        ..options
    }
}
