use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs4::FileExt;

pub const MAINTENANCE_LOCK_FILE: &str = "git-maintenance-step.lock";

/// Exclusive advisory lock over an object store, released on drop.
#[derive(Debug)]
pub struct CrossProcessLock {
    path: PathBuf,
    _file: File,
}

impl CrossProcessLock {
    /// `Ok(None)` when another holder already owns the lock. The parent
    /// directory must exist.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                path: path.to_path_buf(),
                _file: file,
            })),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            #[cfg(windows)]
            Err(err) if matches!(err.raw_os_error(), Some(32 | 33)) => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to lock {}", path.display())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn maintenance_lock_path(objects_root: &Path) -> PathBuf {
    objects_root.join(MAINTENANCE_LOCK_FILE)
}
