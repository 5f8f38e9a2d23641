//! Resumable infrastructure bootstrap pipeline.
//!
//! A fixed sequence of guarded steps (terraform, cluster commands, git pushes
//! and one GitLab API call) provisions a platform. Each step records a
//! completion flag in a durable run state, so an interrupted run resumes where
//! it stopped and a completed run is a no-op. The architecture keeps a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (state keys, secret decoding,
//!   pipeline order checks). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (state file, config, processes,
//!   HTTP). Process and HTTP access sit behind traits so tests run against
//!   scripted fakes.
//!
//! Orchestration modules ([`guard`], [`pipeline`], [`steps`], [`secrets`],
//! [`destroy`], [`status`]) combine the two to implement CLI commands.

pub mod core;
pub mod destroy;
pub mod error;
pub mod exit_codes;
pub mod guard;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod secrets;
pub mod status;
pub mod steps;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
