//! CLI-specific functionality for the cotask binary
//!
//! Argument parsing, configuration discovery and task plans.

pub mod args;
pub mod config;
pub mod plan;

pub use args::{Args, ExecutionMode, RunConfig};
pub use config::ConfigDiscovery;
pub use plan::{Plan, PlanError, PlanFormat, TaskSpec};
