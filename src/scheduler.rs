//! Per-cycle dispatch of a list of work items over a `WorkerPool`.
//!
//! Each call to `CycleScheduler::run_cycle` is one cycle:
//!
//! - The items are partitioned into chunks, a fixed number per thread.
//! - The chunks are pre-loaded into the workers' queues while all workers sleep, and the
//!   workers that received something are released.
//! - The calling thread processes its own share (the tail) while the workers run, then
//!   waits for the chunks to complete, with a timeout.
//! - Failures raised by the items on any thread are collected and logged.
//!
//! Items may ask for a finalization step that must run on the calling thread. In
//! `DispatchMode::Barrier` the finalizations run once everything is done. In
//! `DispatchMode::Split` they run as soon as each item is done, while the other items
//! are still being processed.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use crate::core::job::{Chunk, Job, JobRef};
use crate::core::shutdown::ShutdownHandle;
use crate::core::sync::{AtomicBool, AtomicUsize, Ordering};
use crate::core::thread_pool::WorkerPool;
use crate::error::PoolError;
use crate::faults::{panic_error, CycleFault, FaultSlots};
use crate::partition::{partition, Partition};
use crate::signal::CompletionSignals;

/// What `CycleWork::update` reports about an item.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    Done,
    /// `CycleWork::finalize` must be called for this item on the dispatching thread.
    NeedsFinalize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DispatchMode {
    /// Wait for every chunk, then finalize.
    Barrier,
    /// Track progress item by item and finalize while the workers are still running.
    Split,
}

/// The work of a cycle.
///
/// `update` is called exactly once per item, on any thread, in increasing index order
/// within a chunk. The item list must not change while a cycle is running.
pub trait CycleWork: Send + Sync + 'static {
    type Item;

    fn items(&self) -> &[Self::Item];

    fn update(&self, item: &Self::Item, index: usize, thread_index: usize) -> anyhow::Result<Progress>;

    /// Called on the dispatching thread for each item whose update returned
    /// `Progress::NeedsFinalize`.
    fn finalize(&self, _item: &Self::Item, _index: usize) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A `CycleWork` made of a shared slice and a callback taking an item and the index of
/// the executing thread.
pub struct FnWork<T, F> {
    items: Arc<[T]>,
    callback: F,
}

impl<T, F> FnWork<T, F>
where
    T: Send + Sync + 'static,
    F: Fn(&T, usize) -> anyhow::Result<()> + Send + Sync + 'static,
{
    pub fn new(items: impl Into<Arc<[T]>>, callback: F) -> Self {
        FnWork { items: items.into(), callback }
    }
}

impl<T, F> CycleWork for FnWork<T, F>
where
    T: Send + Sync + 'static,
    F: Fn(&T, usize) -> anyhow::Result<()> + Send + Sync + 'static,
{
    type Item = T;

    fn items(&self) -> &[T] { &self.items }

    fn update(&self, item: &T, _index: usize, thread_index: usize) -> anyhow::Result<Progress> {
        (self.callback)(item, thread_index)?;

        Ok(Progress::Done)
    }
}

#[derive(Clone, Debug)]
pub struct CycleConfig {
    /// How long to wait for the workers before giving up on a cycle. Default: one second.
    pub timeout: Duration,
    /// How long to wait for the workers of the previous cycle to go back to sleep before
    /// running a cycle synchronously instead.
    pub idle_timeout: Duration,
    /// Whether the dispatching thread takes a share of the items. Default: true.
    pub caller_share: bool,
    /// In barrier mode, whether the dispatching thread steals chunks while it waits.
    /// Default: true.
    pub help_while_waiting: bool,
}

impl Default for CycleConfig {
    fn default() -> Self {
        CycleConfig {
            timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_millis(100),
            caller_share: true,
            help_while_waiting: true,
        }
    }
}

/// The outcome of a cycle.
#[derive(Debug)]
pub struct CycleReport {
    pub cycle: u64,
    /// Every item was processed before the timeout.
    pub completed: bool,
    pub timed_out: bool,
    /// The cycle ran entirely on the calling thread because the pool was not available.
    pub synchronous: bool,
    pub items: usize,
    /// Number of chunks pushed into the worker queues.
    pub dispatched_chunks: u32,
    /// Number of failures, including the ones logged early because their thread's slot
    /// was full.
    pub fault_count: u32,
    /// The failures of the cycle, grouped by thread.
    pub faults: Vec<CycleFault>,
}

/// Counters over the lifetime of a scheduler.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub cycles: u64,
    pub timeouts: u64,
    pub synchronous_cycles: u64,
    pub faults: u64,
}

// The per-cycle state shared with the workers. Reference counted so that chunks still
// running after a timeout keep it alive.
struct CycleJob<W> {
    work: Arc<W>,
    cycle: u64,
    mode: DispatchMode,
    signals: Arc<CompletionSignals>,
    faults: Arc<FaultSlots>,
    // Number of processed items, per chunk. Only maintained in split mode.
    progress: Vec<CachePadded<AtomicUsize>>,
    needs_finalize: Vec<AtomicBool>,
}

impl<W: CycleWork> CycleJob<W> {
    fn run_chunk(&self, chunk_index: usize, range: std::ops::Range<usize>, thread_index: usize) {
        profiling::scope!("chunk");
        let items = self.work.items();
        let progress = &self.progress[chunk_index];
        for index in range {
            self.run_item(&items[index], index, thread_index);

            if self.mode == DispatchMode::Split {
                progress.fetch_add(1, Ordering::Release);
                self.signals.wake().notify();
            }
        }

        self.signals.set(chunk_index, self.cycle);
    }

    fn run_item(&self, item: &W::Item, index: usize, thread_index: usize) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.work.update(item, index, thread_index)
        }));

        let error = match result {
            Ok(Ok(Progress::Done)) => return,
            Ok(Ok(Progress::NeedsFinalize)) => {
                // Published by the progress counter or the completion signal.
                self.needs_finalize[index].store(true, Ordering::Relaxed);
                return;
            }
            Ok(Err(error)) => error,
            Err(payload) => panic_error(payload),
        };

        self.faults.record(CycleFault {
            thread_index,
            item_index: index,
            cycle: self.cycle,
            error,
        });
    }

    // Must only be called once the updates of `range` are known to be done.
    fn finalize_range(&self, range: std::ops::Range<usize>, thread_index: usize) {
        let items = self.work.items();
        for index in range {
            if !self.needs_finalize[index].swap(false, Ordering::Relaxed) {
                continue;
            }

            let result = panic::catch_unwind(AssertUnwindSafe(|| self.work.finalize(&items[index], index)));
            let error = match result {
                Ok(Ok(())) => continue,
                Ok(Err(error)) => error,
                Err(payload) => panic_error(payload),
            };

            self.faults.record(CycleFault {
                thread_index,
                item_index: index,
                cycle: self.cycle,
                error: error.context("finalization failed"),
            });
        }
    }

    fn processed(&self) -> usize {
        self.progress.iter().map(|p| p.load(Ordering::Acquire)).sum()
    }
}

impl<W: CycleWork> Job for CycleJob<W> {
    fn execute(&self, chunk: Chunk, thread_index: usize) {
        debug_assert_eq!(chunk.cycle, self.cycle);
        self.run_chunk(chunk.index, chunk.range(), thread_index);
    }
}

/// Runs cycles of work over a pool it owns.
pub struct CycleScheduler {
    pool: WorkerPool,
    config: CycleConfig,
    cycle: u64,
    signals: Arc<CompletionSignals>,
    faults: Arc<FaultSlots>,
    stats: SchedulerStats,
}

impl CycleScheduler {
    pub fn new(pool: WorkerPool, config: CycleConfig) -> Self {
        let num_threads = pool.num_worker_threads() as usize + 1;
        CycleScheduler {
            pool,
            config,
            cycle: 0,
            signals: Arc::new(CompletionSignals::new(num_threads * 2)),
            faults: Arc::new(FaultSlots::new(num_threads)),
            stats: SchedulerStats::default(),
        }
    }

    /// A scheduler with one worker per logical core and the default configuration.
    pub fn with_default_pool() -> Result<Self, PoolError> {
        let pool = WorkerPool::builder().build()?;

        Ok(CycleScheduler::new(pool, CycleConfig::default()))
    }

    pub fn pool(&self) -> &WorkerPool { &self.pool }

    pub fn config(&self) -> &CycleConfig { &self.config }

    pub fn config_mut(&mut self) -> &mut CycleConfig { &mut self.config }

    /// The number of the last cycle that was started. Cycles are numbered from one.
    pub fn cycle_counter(&self) -> u64 { self.cycle }

    pub fn stats(&self) -> SchedulerStats { self.stats }

    /// Failures recorded since the last cycle ended. Only non-zero while work of a
    /// timed out cycle is still running.
    pub fn pending_faults(&self) -> u32 { self.faults.pending() }

    /// Shut the pool down. Subsequent cycles run synchronously.
    pub fn shut_down(&self) -> ShutdownHandle {
        self.pool.shut_down()
    }

    /// Run `callback` on each item, using the pool.
    ///
    /// The callback receives the item and the index of the thread that runs it.
    pub fn run_items<T, F>(
        &mut self,
        items: impl Into<Arc<[T]>>,
        callback: F,
        chunks_per_thread: usize,
        mode: DispatchMode,
    ) -> CycleReport
    where
        T: Send + Sync + 'static,
        F: Fn(&T, usize) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let work = Arc::new(FnWork::new(items, callback));
        self.run_cycle(&work, chunks_per_thread, mode)
    }

    /// Run one cycle of `work` and block until it is done or timed out.
    pub fn run_cycle<W: CycleWork>(
        &mut self,
        work: &Arc<W>,
        chunks_per_thread: usize,
        mode: DispatchMode,
    ) -> CycleReport {
        profiling::scope!("run_cycle");
        self.cycle += 1;
        self.stats.cycles += 1;
        let cycle = self.cycle;
        let item_count = work.items().len();

        let num_workers = self.pool.num_worker_threads() as usize;
        // The calling thread uses the slot after the workers.
        let caller_thread = num_workers;
        let caller_share = self.config.caller_share;
        let available_threads = if caller_share { num_workers + 1 } else { num_workers };
        let partition = partition(item_count, available_threads, chunks_per_thread, caller_share);

        // One signal and progress counter per chunk plus one for the tail.
        let num_slots = partition.chunks.len() + 1;
        if self.signals.num_signals() < num_slots {
            self.signals = Arc::new(CompletionSignals::new(num_slots));
        }

        let job = Arc::new(CycleJob {
            work: work.clone(),
            cycle,
            mode,
            signals: self.signals.clone(),
            faults: self.faults.clone(),
            progress: (0..num_slots).map(|_| CachePadded::new(AtomicUsize::new(0))).collect(),
            needs_finalize: (0..item_count).map(|_| AtomicBool::new(false)).collect(),
        });

        let start = Instant::now();
        let deadline = start + self.config.timeout;

        let dispatched_chunks = match dispatch(
            &mut self.pool,
            &job,
            &partition,
            &self.signals,
            cycle,
            self.config.idle_timeout,
        ) {
            Ok(dispatched) => dispatched,
            Err(error) => {
                log::warn!("Cycle {cycle}: {error}, running {item_count} items on the calling thread");
                self.stats.synchronous_cycles += 1;
                job.run_chunk(0, 0..item_count, caller_thread);
                job.finalize_range(0..item_count, caller_thread);

                return self.report(cycle, true, true, item_count, 0);
            }
        };

        // Our share, while the workers process theirs.
        if let Some(tail) = partition.tail {
            job.run_chunk(tail.chunk_index, tail.range(), caller_thread);
        }

        let completed = match mode {
            DispatchMode::Barrier => self.wait_barrier(&job, &partition, deadline),
            DispatchMode::Split => self.wait_split(&job, &partition, deadline),
        };

        if !completed {
            self.stats.timeouts += 1;
            let done = (0..partition.chunks.len())
                .filter(|&idx| self.signals.is_set(idx, cycle))
                .count();
            log::error!(
                "Cycle {cycle} timed out after {:?}: {done} of {} chunks completed, a worker may be stuck",
                self.config.timeout,
                partition.chunks.len(),
            );
        }

        log::trace!("Cycle {cycle}: {item_count} items, {dispatched_chunks} chunks in {:?}", start.elapsed());

        self.report(cycle, completed, false, item_count, dispatched_chunks)
    }

    fn wait_barrier<W: CycleWork>(&self, job: &CycleJob<W>, partition: &Partition, deadline: Instant) -> bool {
        let caller_thread = self.pool.num_worker_threads() as usize;
        let cycle = job.cycle;

        if self.config.help_while_waiting {
            profiling::scope!("help");
            while let Some(stolen) = self.pool.steal_one(0) {
                stolen.execute(caller_thread);
                if Instant::now() >= deadline {
                    break;
                }
            }
        }

        let completed = self.signals.wait_all(0..partition.chunks.len(), cycle, deadline);

        profiling::scope!("finalize");
        for chunk in partition.chunks.iter().chain(partition.tail.iter()) {
            // Items of chunks that are still running after a timeout are left alone.
            if self.signals.is_set(chunk.chunk_index, cycle) {
                job.finalize_range(chunk.range(), caller_thread);
            }
        }

        completed
    }

    fn wait_split<W: CycleWork>(&self, job: &CycleJob<W>, partition: &Partition, deadline: Instant) -> bool {
        let caller_thread = self.pool.num_worker_threads() as usize;
        let ranges: Vec<_> = partition.chunks.iter()
            .chain(partition.tail.iter())
            .filter(|chunk| !chunk.is_empty())
            .collect();
        let mut cursors: Vec<usize> = ranges.iter().map(|chunk| chunk.start).collect();

        loop {
            let mut advanced = false;
            let mut all_done = true;
            for (chunk, cursor) in ranges.iter().zip(cursors.iter_mut()) {
                let done = chunk.start + job.progress[chunk.chunk_index].load(Ordering::Acquire);
                if done > *cursor {
                    job.finalize_range(*cursor..done, caller_thread);
                    *cursor = done;
                    advanced = true;
                }
                all_done &= *cursor == chunk.end;
            }

            if all_done {
                return true;
            }

            if !advanced {
                let seen = job.processed();
                if !self.signals.wake().wait_until(deadline, || job.processed() != seen) {
                    return false;
                }
            }
        }
    }

    fn report(&mut self, cycle: u64, completed: bool, synchronous: bool, items: usize, dispatched_chunks: u32) -> CycleReport {
        let drained = self.faults.drain();
        self.stats.faults += drained.count as u64;
        if drained.count > 0 {
            log::error!("Cycle {cycle}: {} work items failed", drained.count);
        }

        CycleReport {
            cycle,
            completed,
            timed_out: !completed,
            synchronous,
            items,
            dispatched_chunks,
            fault_count: drained.count,
            faults: drained.faults,
        }
    }
}

// Pre-load the non-empty chunks and release the workers that received any.
fn dispatch<W: CycleWork>(
    pool: &mut WorkerPool,
    job: &Arc<CycleJob<W>>,
    partition: &Partition,
    signals: &CompletionSignals,
    cycle: u64,
    idle_timeout: Duration,
) -> Result<u32, PoolError> {
    profiling::scope!("dispatch");
    let mut preload = pool.preload(idle_timeout)?;

    for chunk in partition.chunks.iter().chain(partition.tail.iter()) {
        signals.reset(chunk.chunk_index);
    }

    let job: Arc<dyn Job> = job.clone();
    let mut dispatched = 0;
    for chunk in &partition.chunks {
        if chunk.is_empty() {
            signals.set(chunk.chunk_index, cycle);
            continue;
        }

        preload.enqueue_task(
            chunk.thread_index,
            JobRef::new(
                job.clone(),
                Chunk { start: chunk.start, end: chunk.end, index: chunk.chunk_index, cycle },
            ),
        );
        dispatched += 1;
    }

    preload.release(partition.threads_with_work() as u32);

    Ok(dispatched)
}
