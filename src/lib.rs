//! patchgate library crate.
//!
//! The primary interface is the `patchgate` binary. This lib.rs exposes the
//! harness modules so that integration tests (and embedding evaluation
//! drivers) can prepare fixtures, run graders and evaluate agents directly
//! without going through the CLI.

pub mod agent;
pub mod catalog;
pub mod config;
pub mod error;
pub mod fixture;
pub mod grader;
pub mod model;
pub mod patch_engine;
pub mod pool;
pub mod process;
pub mod runner;
pub mod validation;

// Private modules only used by the binary: format, telemetry
