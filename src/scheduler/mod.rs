//! Cooperative scheduler for hierarchical tasks.
//!
//! A single coordinator ([`Scheduler`]) drives every task through
//! `New -> Prepared -> Running -> Finished` on each [`Scheduler::tick`]:
//! it admits tasks whose prepare-stage resources are free, dispatches bodies
//! inline or on dedicated worker threads, polls them for completion,
//! propagates errors and cancellation to parents and admits subtasks
//! discovered along the way.

pub mod config;
pub mod coordinator;
pub mod events;
pub(crate) mod info;
pub(crate) mod locks;
pub(crate) mod progress;
pub mod registry;
pub mod worker;


pub use config::*;
pub use coordinator::*;
pub use events::*;
pub use registry::*;
pub use worker::WorkerPriority;
