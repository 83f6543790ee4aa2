//! Internal implementation modules for `objkeep-core`.
//!
//! The CLI goes through the re-exports in `lib.rs`.

pub mod commands;
pub mod config;
pub mod maintenance;
pub mod objects;
pub mod runtime;
pub mod tooling;
