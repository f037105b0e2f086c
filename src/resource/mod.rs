//! Named counting resources consumed by tasks.
//!
//! The scheduler only needs non-blocking `try_acquire(n)` / `release(n)` on
//! resources looked up by id. [`AppResourcePool`] is the default pool and
//! always provides the [`RESOURCE_THREAD`] resource that caps the number of
//! concurrently running worker threads.

pub mod pool;

pub use pool::*;
