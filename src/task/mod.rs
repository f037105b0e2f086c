//! The task contract: a shared [`Task`] handle carrying state, flags,
//! subtasks and resource requirements, plus the [`TaskBody`] trait through
//! which domain code plugs in its behavior.

pub mod body;
pub mod handle;
pub mod tree;
pub mod types;


pub use body::{FnBody, NoopBody, TaskBody, TaskContext};
pub use handle::*;
pub use tree::*;
pub use types::*;
