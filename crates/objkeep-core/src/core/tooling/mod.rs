//! CLI-facing outcome shaping.

pub mod outcome;
