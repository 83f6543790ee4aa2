//! Collaborators the engine talks to: git, the process table, the layout gate.

pub mod effects;
pub mod process;
