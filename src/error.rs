use std::time::Duration;

use crate::core::MAX_WORKERS;

/// Errors reported by the worker pool.
///
/// Failures of the work itself are not errors at this level: they are collected per
/// thread and reported with each cycle (see `CycleReport`).
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("invalid number of worker threads: {0} (expected 1 to {max})", max = MAX_WORKERS)]
    InvalidThreadCount(u32),

    #[error("failed to spawn worker thread #{index}")]
    Spawn {
        index: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("worker threads still busy after {0:?}")]
    Busy(Duration),

    #[error("the worker pool is shut down")]
    ShutDown,
}
