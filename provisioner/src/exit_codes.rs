//! Stable exit codes for provisioner CLI commands.

/// Command succeeded (including dry runs and fully skipped pipelines).
pub const OK: i32 = 0;
/// Any failure: invalid config, a failed step, unreadable state.
pub const FAILURE: i32 = 1;
