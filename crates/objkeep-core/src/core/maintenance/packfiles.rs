//! Pack-file upkeep through the multi-pack-index: expire packs whose objects
//! moved elsewhere, then repack a batch of small packs into one.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use objkeep_domain::{Enlistment, PackEntry, PackFileInventory, IDX_EXTENSION, PACK_EXTENSION};
use tracing::{debug, info, warn};

use super::step::{MaintenanceStep, StepContext, StepOptions};
use super::time_gate::TimeGate;

pub const PACK_MAINTENANCE_LAST_RUN_FILE: &str = "pack-maintenance.time";
const MULTI_PACK_INDEX: &str = "multi-pack-index";
const MULTI_PACK_INDEX_LOCK: &str = "multi-pack-index.lock";
const TIME_BETWEEN_RUNS: Duration = Duration::from_secs(24 * 60 * 60);

pub struct PackfileMaintenanceStep {
    options: StepOptions,
    batch_size: u64,
}

impl PackfileMaintenanceStep {
    #[must_use]
    pub fn new(options: StepOptions, batch_size: u64) -> Self {
        Self {
            options,
            batch_size,
        }
    }

    fn verify_or_rewrite(&self, ctx: &StepContext, objects_root: &str) -> Result<()> {
        let verify = ctx.run_git(multi_pack_index_args(objects_root, &["verify"]))?;
        if verify.success() {
            return Ok(());
        }
        warn!(
            area = self.area(),
            "multi-pack-index failed verification; rewriting it"
        );
        let midx = ctx.enlistment().pack_root().join(MULTI_PACK_INDEX);
        remove_if_present(midx.as_std_path())
            .with_context(|| format!("failed to delete {midx}"))?;
        ctx.run_git(multi_pack_index_args(objects_root, &["write"]))?;
        Ok(())
    }
}

impl MaintenanceStep for PackfileMaintenanceStep {
    fn area(&self) -> &'static str {
        "PackfileMaintenanceStep"
    }

    fn progress_message(&self) -> String {
        "Cleaning up pack-files".to_string()
    }

    fn requires_store_lock(&self) -> bool {
        self.options.requires_store_lock
    }

    fn time_gate(&self, enlistment: &Enlistment) -> Option<TimeGate> {
        Some(TimeGate::new(
            self.area(),
            enlistment.info_dir().join(PACK_MAINTENANCE_LAST_RUN_FILE),
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

        let before = ctx.pack_inventory()?;
        if ctx.enlistment().uses_smart_protocol() && !before.has_keep_file {
            warn!(
                area = self.area(),
                "skipping pack maintenance: no .keep pack protects the base pack"
            );
            return Ok(());
        }

        let objects_root = ctx.enlistment().objects_root().to_string();
        let pack_root = ctx.enlistment().pack_root();
        let lock = pack_root.join(MULTI_PACK_INDEX_LOCK);
        remove_if_present(lock.as_std_path()).with_context(|| format!("failed to delete {lock}"))?;

        let expire = ctx.run_git(multi_pack_index_args(&objects_root, &["expire"]))?;
        let (deleted_idx, blocked_idx) = clean_stale_idx_files(pack_root.as_std_path())
            .with_context(|| format!("failed to clean stale idx files in {pack_root}"))?;
        self.verify_or_rewrite(ctx, &objects_root)?;

        let after_expire = ctx.pack_inventory()?;
        let batch_size = effective_batch_size(&after_expire, self.batch_size);
        let plan = plan_repack_batch(&after_expire, batch_size);
        debug!(
            area = self.area(),
            batch_size,
            planned = %plan.iter().map(|pack| pack.name.as_str()).collect::<Vec<_>>().join(";"),
            "repack plan"
        );

        let repack = ctx.run_git([
            "-c".to_string(),
            "core.multiPackIndex=true".to_string(),
            "-c".to_string(),
            "pack.threads=1".to_string(),
            "-c".to_string(),
            "repack.packKeptObjects=true".to_string(),
            "multi-pack-index".to_string(),
            format!("--object-dir={objects_root}"),
            "repack".to_string(),
            format!("--batch-size={batch_size}"),
        ])?;
        self.verify_or_rewrite(ctx, &objects_root)?;

        let after = ctx.pack_inventory()?;
        info!(
            area = self.area(),
            objects_root = %objects_root,
            batch_size,
            expire_exit_code = expire.code,
            repack_exit_code = repack.code,
            before_count = before.count,
            before_size = before.total_size,
            after_expire_count = after_expire.count,
            after_count = after.count,
            after_size = after.total_size,
            after_second_largest = after.second_largest_size,
            stale_idx_deleted = deleted_idx.len(),
            stale_idx_blocked = blocked_idx,
            "pack maintenance finished"
        );
        gate.save_last_run_time();
        Ok(())
    }
}

fn multi_pack_index_args(objects_root: &str, tail: &[&str]) -> Vec<String> {
    let mut args = vec![
        "-c".to_string(),
        "core.multiPackIndex=true".to_string(),
        "multi-pack-index".to_string(),
        format!("--object-dir={objects_root}"),
    ];
    args.extend(tail.iter().map(ToString::to_string));
    args
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Delete `.idx` files whose `.pack` is gone. Returns the deleted names and
/// how many deletions were refused (e.g. a handle still holds the file).
pub fn clean_stale_idx_files(pack_root: &Path) -> io::Result<(Vec<String>, usize)> {
    let mut deleted = Vec::new();
    let mut blocked = 0;
    let entries = match fs::read_dir(pack_root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok((deleted, blocked)),
        Err(err) => return Err(err),
    };
    for entry in entries {
        let path = entry?.path();
        let is_idx = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(IDX_EXTENSION));
        if !is_idx || path.with_extension(PACK_EXTENSION).exists() {
            continue;
        }
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        match fs::remove_file(&path) {
            Ok(()) => deleted.push(name),
            Err(err) => {
                debug!(idx = %name, error = %err, "stale idx deletion blocked");
                blocked += 1;
            }
        }
    }
    deleted.sort();
    Ok((deleted, blocked))
}

/// Repack budget: `configured`, unless the survivors already fit under it and
/// more than two packs remain, in which case the second-largest pack's size so
/// only the largest pack sits out.
#[must_use]
pub fn effective_batch_size(inventory: &PackFileInventory, configured: u64) -> u64 {
    if inventory.total_size < configured && inventory.count > 2 {
        inventory.second_largest_size
    } else {
        configured
    }
}

/// Packs small enough to join a batch, oldest first.
#[must_use]
pub fn repack_candidates(inventory: &PackFileInventory, budget: u64) -> Vec<&PackEntry> {
    inventory
        .by_modified_time()
        .into_iter()
        .filter(|pack| pack.size <= budget)
        .collect()
}

/// Candidates taken oldest first until their sizes add up to `budget`. Empty
/// when the candidates never reach it.
#[must_use]
pub fn plan_repack_batch(inventory: &PackFileInventory, budget: u64) -> Vec<&PackEntry> {
    let mut batch = Vec::new();
    let mut total = 0u64;
    for pack in repack_candidates(inventory, budget) {
        batch.push(pack);
        total = total.saturating_add(pack.size);
        if total >= budget {
            return batch;
        }
    }
    Vec::new()
}
