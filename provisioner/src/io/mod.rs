//! I/O adapters: state file, config, processes, cluster and API clients.

pub mod api;
pub mod config;
pub mod git;
pub mod init;
pub mod kubectl;
pub mod process;
pub mod readiness;
pub mod run_state;
pub mod terraform;
