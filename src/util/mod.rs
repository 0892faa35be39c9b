//! Helpers shared by the backup steps.

pub mod lock;
pub mod process;
