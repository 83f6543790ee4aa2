use std::time::Duration;

use anyhow::Result;
use objkeep_domain::Enlistment;
use tracing::info;

use super::step::{MaintenanceStep, StepContext, StepOptions};
use super::time_gate::TimeGate;

pub const LOOSE_OBJECTS_LAST_RUN_FILE: &str = "loose-objects.time";
pub const DEFAULT_MAX_LOOSE_OBJECTS_IN_PACK: u32 = 50_000;
const TIME_BETWEEN_RUNS: Duration = Duration::from_secs(24 * 60 * 60);

/// Prunes loose objects already in packs and packs up to a batch of the rest.
pub struct LooseObjectsStep {
    options: StepOptions,
    max_loose_objects_in_pack: u32,
}

impl LooseObjectsStep {
    #[must_use]
    pub fn new(options: StepOptions) -> Self {
        Self {
            options,
            max_loose_objects_in_pack: DEFAULT_MAX_LOOSE_OBJECTS_IN_PACK,
        }
    }

    #[must_use]
    pub fn with_max_loose_objects_in_pack(mut self, max: u32) -> Self {
        self.max_loose_objects_in_pack = max;
        self
    }

    pub(crate) fn git_args(&self) -> Vec<String> {
        vec![
            "-c".to_string(),
            "pack.window=0".to_string(),
            "-c".to_string(),
            "pack.depth=0".to_string(),
            "-c".to_string(),
            format!(
                "maintenance.loose-objects.batchSize={}",
                self.max_loose_objects_in_pack
            ),
            "maintenance".to_string(),
            "run".to_string(),
            "--task=loose-objects".to_string(),
        ]
    }
}

impl MaintenanceStep for LooseObjectsStep {
    fn area(&self) -> &'static str {
        "LooseObjectsStep"
    }

    fn progress_message(&self) -> String {
        "Cleaning up loose objects".to_string()
    }

    fn requires_store_lock(&self) -> bool {
        self.options.requires_store_lock
    }

    fn time_gate(&self, enlistment: &Enlistment) -> Option<TimeGate> {
        Some(TimeGate::new(
            self.area(),
            enlistment.info_dir().join(LOOSE_OBJECTS_LAST_RUN_FILE),
            TIME_BETWEEN_RUNS,
        ))
    }

    fn perform(&self, ctx: &StepContext) -> Result<()> {
        let Some(gate) = self.time_gate(ctx.enlistment()) else {
            return Ok(());
        };
        if !self.options.force_run && ctx.should_defer(&gate)? {
            return Ok(());
        }

        let loose_before = ctx.loose_object_inventory()?;
        let packs_before = ctx.pack_inventory()?;

        let output = ctx.run_git(self.git_args())?;

        let loose_after = ctx.loose_object_inventory()?;
        let packs_after = ctx.pack_inventory()?;

        info!(
            area = self.area(),
            objects_root = %ctx.enlistment().objects_root(),
            exit_code = output.code,
            starting_count = loose_before.count,
            ending_count = loose_after.count,
            starting_size = loose_before.size,
            ending_size = loose_after.size,
            starting_pack_count = packs_before.count,
            ending_pack_count = packs_after.count,
            starting_pack_size = packs_before.total_size,
            ending_pack_size = packs_after.total_size,
            starting_second_largest = packs_before.second_largest_size,
            ending_second_largest = packs_after.second_largest_size,
            removed_count = loose_before.count.saturating_sub(loose_after.count),
            "loose object maintenance finished"
        );
        gate.save_last_run_time();
        Ok(())
    }
}
