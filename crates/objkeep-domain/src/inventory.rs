//! Point-in-time snapshots of the object store used for before/after diffs.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::Path;
use std::time::SystemTime;

use serde::Serialize;

pub const PACK_EXTENSION: &str = "pack";
pub const IDX_EXTENSION: &str = "idx";
pub const KEEP_EXTENSION: &str = "keep";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackEntry {
    pub name: String,
    pub size: u64,
    pub modified: SystemTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PackFileInventory {
    pub count: usize,
    pub total_size: u64,
    pub second_largest_size: u64,
    pub has_keep_file: bool,
    #[serde(skip)]
    pub packs: Vec<PackEntry>,
}

impl PackFileInventory {
    /// Scan `pack_root`. A missing directory is an empty inventory.
    pub fn scan(pack_root: &Path) -> io::Result<Self> {
        let entries = match fs::read_dir(pack_root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(err),
        };

        let mut packs = Vec::new();
        let mut has_keep_file = false;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Some(extension) = path.extension().and_then(|ext| ext.to_str()) else {
                continue;
            };
            if extension.eq_ignore_ascii_case(PACK_EXTENSION) {
                let metadata = entry.metadata()?;
                if !metadata.is_file() {
                    continue;
                }
                packs.push(PackEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    size: metadata.len(),
                    modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                });
            } else if extension.eq_ignore_ascii_case(KEEP_EXTENSION) {
                has_keep_file = true;
            }
        }
        packs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self::from_packs(packs, has_keep_file))
    }

    #[must_use]
    pub fn from_packs(packs: Vec<PackEntry>, has_keep_file: bool) -> Self {
        let mut largest = 0u64;
        let mut second_largest = 0u64;
        let mut total_size = 0u64;
        for pack in &packs {
            total_size += pack.size;
            if pack.size > largest {
                second_largest = largest;
                largest = pack.size;
            } else if pack.size > second_largest {
                second_largest = pack.size;
            }
        }
        Self {
            count: packs.len(),
            total_size,
            second_largest_size: second_largest,
            has_keep_file,
            packs,
        }
    }

    /// Packs ordered oldest first, ties broken by name.
    #[must_use]
    pub fn by_modified_time(&self) -> Vec<&PackEntry> {
        let mut ordered: Vec<&PackEntry> = self.packs.iter().collect();
        ordered.sort_by(|a, b| a.modified.cmp(&b.modified).then(a.name.cmp(&b.name)));
        ordered
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LooseObjectInventory {
    pub count: usize,
    pub size: u64,
}

impl LooseObjectInventory {
    /// Count files under the two-hex-digit fan-out directories of `objects_root`.
    pub fn scan(objects_root: &Path) -> io::Result<Self> {
        let mut inventory = Self::default();
        if !objects_root.is_dir() {
            return Ok(inventory);
        }
        for entry in walkdir::WalkDir::new(objects_root)
            .min_depth(2)
            .max_depth(2)
        {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let in_fanout_dir = entry
                .path()
                .parent()
                .and_then(Path::file_name)
                .and_then(|name| name.to_str())
                .is_some_and(is_loose_object_dir);
            if !in_fanout_dir {
                continue;
            }
            inventory.count += 1;
            inventory.size += entry.metadata().map_err(io::Error::from)?.len();
        }
        Ok(inventory)
    }
}

#[must_use]
pub fn is_loose_object_dir(name: &str) -> bool {
    name.len() == 2 && name.bytes().all(|b| b.is_ascii_hexdigit())
}
