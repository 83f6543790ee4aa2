//! Environment-derived settings.

pub mod settings;

pub use settings::*;
