#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod enlistment;
pub mod inventory;
pub mod object_id;
pub mod task;

pub use enlistment::Enlistment;
pub use inventory::{
    is_loose_object_dir, LooseObjectInventory, PackEntry, PackFileInventory, IDX_EXTENSION,
    KEEP_EXTENSION, PACK_EXTENSION,
};
pub use object_id::{ObjectId, ObjectIdError};
pub use task::{MaintenanceTask, TaskParseError};
