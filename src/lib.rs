//! # cotask
//!
//! A cooperative coordinator for hierarchical tasks. Every state transition
//! happens on one coordinator thread that repeatedly calls
//! [`Scheduler::tick`]; task bodies run either inline on that thread or on
//! dedicated worker threads, and the coordinator polls them instead of
//! blocking.
//!
//! ## Architecture Overview
//!
//! - **[`task`]**: the task contract: shared [`Task`] handles, the [`TaskBody`]
//!   trait, flags, resource usage and tree helpers
//! - **[`resource`]**: named counting resources, including the built-in thread
//!   resource that caps concurrent workers
//! - **[`scheduler`]**: the coordinator, worker threads, progress aggregation
//!   and configuration
//! - **[`cli`]**: argument parsing, config discovery and TOML plans for the binary
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cotask::{Scheduler, SchedulerConfig, Task, TaskFlags};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut scheduler = Scheduler::new(SchedulerConfig::default())?;
//!
//!     let build = Task::group("build", TaskFlags::FAIL_ON_SUBTASK_ERROR)
//!         .subtask(Task::from_fn("compile", |ctx| {
//!             ctx.set_progress(100);
//!             Ok(())
//!         }))
//!         .build();
//!     scheduler.register_top_level_task(build.clone())?;
//!     scheduler.run_until_idle().await;
//!
//!     println!("{} finished, error: {:?}", build.name(), build.error());
//!     Ok(())
//! }
//! ```

/// Task handles, bodies and task-tree helpers.
pub mod task;

/// Resource pool consumed by admission and dispatch.
pub mod resource;

/// The coordinator and its worker threads.
pub mod scheduler;

/// Environment constants and path utilities.
pub mod env;

// CLI module for command-line interface
pub mod cli;

pub use resource::{AppResourcePool, RESOURCE_THREAD, Resource, ResourcePool, ResourceSemaphore};
pub use scheduler::{
    LoggingEventHandler, RecordingEventHandler, Scheduler, SchedulerConfig, SchedulerError,
    SchedulerEvent, SchedulerEventHandler,
};
pub use task::{
    ProgressManagement, ReportResult, Task, TaskBody, TaskBuilder, TaskContext, TaskError,
    TaskFlags, TaskId, TaskResourceUsage, TaskState,
};
