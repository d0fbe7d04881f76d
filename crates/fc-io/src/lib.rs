#![forbid(unsafe_code)]
//! Completion tracking and physical submission for FrankenCache.
//!
//! A logical I/O is issued through [`IoEngine`], which splits it into
//! submissions that satisfy the target device's geometry and ties all of
//! them to one [`IoTracker`]. Synchronous callers block on the tracker;
//! asynchronous callers get a callback once the last part completes.

mod engine;
mod pool;
mod target;
mod tracker;

pub use engine::{EngineCounters, IoEngine};
pub use pool::{PagePool, PooledPage};
pub use target::IoTarget;
pub use tracker::{IoRef, IoTracker};
