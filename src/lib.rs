//! A work-stealing worker pool and a scheduler that runs lists of independent items
//! over it, one cycle at a time.
//!
//! The building blocks:
//! - `WorkStealingDeque`: a Chase-Lev deque. The owner pushes and pops at the bottom,
//!   other threads steal from the top.
//! - `WorkerPool`: persistent worker threads, each owning a deque. Work is pre-loaded
//!   into the deques while the workers sleep, then the workers are released and balance
//!   the load by stealing from each other.
//! - `CycleScheduler`: splits a list of items into chunks, dispatches them to the pool,
//!   takes a share on the calling thread, and waits for the cycle to complete with a
//!   timeout. Failures of individual items are collected on whichever thread they happen
//!   and reported once the cycle is over.
//!
//! There is no implicit global pool: a pool is created explicitly and shut down when
//! dropped.

mod core;
pub mod util;
pub mod error;
pub mod partition;
pub mod signal;
pub mod faults;
pub mod scheduler;

pub use crate::core::MAX_WORKERS;
pub use crate::core::WorkerHook;
pub use crate::core::deque::{Steal, WorkStealingDeque};
pub use crate::core::ring_buffer::RingBuffer;
pub use crate::core::job::{Chunk, Job, JobRef};
pub use crate::core::thread_pool::{WorkerPool, WorkerPoolBuilder, Preload, WorkerStats};
pub use crate::core::shutdown::ShutdownHandle;
pub use crate::core::sync;
pub use crate::error::PoolError;
pub use crate::faults::CycleFault;
pub use crate::partition::{partition, Partition, PartitionRange};
pub use crate::scheduler::{
    CycleConfig, CycleReport, CycleScheduler, CycleWork, DispatchMode, FnWork, Progress,
    SchedulerStats,
};

pub use crossbeam_utils::CachePadded;
